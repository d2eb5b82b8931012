use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MessageStatus {
	Queued,
	Processing,
	Sent,
	Delivered,
	Bounced,
	Failed,
	Rejected,
}

impl MessageStatus {
	pub fn is_terminal(self) -> bool {
		matches!(
			self,
			MessageStatus::Sent
				| MessageStatus::Delivered
				| MessageStatus::Bounced
				| MessageStatus::Failed
				| MessageStatus::Rejected
		)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MessageType {
	Email,
	Sms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SuppressionReason {
	HardBounce,
	SoftBounce,
	Complaint,
	Unsubscribe,
	Manual,
}

impl SuppressionReason {
	pub fn as_str(self) -> &'static str {
		match self {
			SuppressionReason::HardBounce => "hard_bounce",
			SuppressionReason::SoftBounce => "soft_bounce",
			SuppressionReason::Complaint => "complaint",
			SuppressionReason::Unsubscribe => "unsubscribe",
			SuppressionReason::Manual => "manual",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeliveryStatus {
	Pending,
	Delivered,
	Failed,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
	pub id: Uuid,
	pub key_hash: String,
	pub name: String,
	pub rate_limit_per_second: i32,
	pub created_at: DateTime<Utc>,
	pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Domain {
	pub id: Uuid,
	pub api_key_id: Uuid,
	pub domain: String,
	pub verified: bool,
	pub dkim_selector: Option<String>,
	pub dkim_private_key: Option<String>,
	pub created_at: DateTime<Utc>,
	pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Message {
	pub id: Uuid,
	pub api_key_id: Uuid,
	pub idempotency_key: Option<String>,
	#[sqlx(rename = "type")]
	pub kind: MessageType,
	pub status: MessageStatus,
	pub from_address: String,
	pub to_address: String,
	pub subject: Option<String>,
	pub body: Option<String>,
	pub html_body: Option<String>,
	pub metadata: serde_json::Value,
	pub attempts: i32,
	pub failure_reason: Option<String>,
	pub created_at: DateTime<Utc>,
	pub claimed_at: Option<DateTime<Utc>>,
	pub sent_at: Option<DateTime<Utc>>,
	pub delivered_at: Option<DateTime<Utc>>,
	pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Suppression {
	pub id: Uuid,
	pub api_key_id: Uuid,
	pub email: String,
	pub reason: SuppressionReason,
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Webhook {
	pub id: Uuid,
	pub api_key_id: Uuid,
	pub url: String,
	pub events: Vec<String>,
	pub secret: String,
	pub active: bool,
	pub created_at: DateTime<Utc>,
}

impl Webhook {
	pub fn subscribes_to(&self, event: &str) -> bool {
		self.events.iter().any(|e| e == event || e == "*")
	}
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookDelivery {
	pub id: Uuid,
	pub webhook_id: Uuid,
	pub message_id: Option<Uuid>,
	pub event: String,
	pub payload: serde_json::Value,
	pub status: DeliveryStatus,
	pub attempts: i32,
	pub last_attempt_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
}

/// Canonical form used everywhere an address is compared or stored:
/// message insert, suppression insert, suppression lookup. The three sites
/// must agree or suppressed recipients slip through.
pub fn normalize_address(address: &str) -> String {
	address.trim().to_ascii_lowercase()
}

pub fn address_domain(address: &str) -> Option<&str> {
	let (_, domain) = address.trim().rsplit_once('@')?;
	if domain.is_empty() {
		return None;
	}
	Some(domain)
}
