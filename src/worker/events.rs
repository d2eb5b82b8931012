use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::store::MailStore;

pub const EVENT_SENT: &str = "message.sent";
pub const EVENT_BOUNCED: &str = "message.bounced";
pub const EVENT_FAILED: &str = "message.failed";

/// Reserved in the taxonomy, never emitted by the worker.
pub const RESERVED_EVENTS: [&str; 5] = [
	"message.queued",
	"message.delivered",
	"message.opened",
	"message.clicked",
	"complaint.received",
];

#[derive(Debug, Clone)]
pub enum MessageEvent {
	Sent {
		smtp_id: String,
	},
	Bounced {
		code: Option<u16>,
		description: String,
	},
	Failed {
		reason: String,
	},
}

impl MessageEvent {
	pub fn name(&self) -> &'static str {
		match self {
			MessageEvent::Sent { .. } => EVENT_SENT,
			MessageEvent::Bounced { .. } => EVENT_BOUNCED,
			MessageEvent::Failed { .. } => EVENT_FAILED,
		}
	}

	pub fn payload(&self, message_id: Uuid) -> serde_json::Value {
		let timestamp = Utc::now().to_rfc3339();
		let value = match self {
			MessageEvent::Sent { smtp_id } => serde_json::to_value(SentPayload {
				event: self.name(),
				timestamp,
				message_id,
				smtp_message_id: smtp_id.clone(),
			}),
			MessageEvent::Bounced { code, description } => serde_json::to_value(BouncedPayload {
				event: self.name(),
				timestamp,
				message_id,
				bounce_type: "hard",
				bounce_code: *code,
				bounce_message: description.clone(),
			}),
			MessageEvent::Failed { reason } => serde_json::to_value(FailedPayload {
				event: self.name(),
				timestamp,
				message_id,
				failure_reason: reason.clone(),
			}),
		};
		// Serialization of these payload structs cannot fail.
		value.unwrap_or_else(|_| serde_json::json!({ "event": self.name() }))
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SentPayload {
	event: &'static str,
	timestamp: String,
	message_id: Uuid,
	smtp_message_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BouncedPayload {
	event: &'static str,
	timestamp: String,
	message_id: Uuid,
	bounce_type: &'static str,
	#[serde(skip_serializing_if = "Option::is_none")]
	bounce_code: Option<u16>,
	bounce_message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FailedPayload {
	event: &'static str,
	timestamp: String,
	message_id: Uuid,
	failure_reason: String,
}

/// Fans a status change out to every subscribed active webhook as a pending
/// delivery row. Failing to enqueue never fails the message transition:
/// errors are logged and the event is dropped for that webhook.
pub async fn emit(
	store: &dyn MailStore,
	api_key_id: Uuid,
	message_id: Uuid,
	event: &MessageEvent,
) {
	let webhooks = match store.active_webhooks(api_key_id).await {
		Ok(webhooks) => webhooks,
		Err(err) => {
			warn!(%api_key_id, %message_id, event = event.name(), "webhook lookup failed, dropping event: {err}");
			return;
		}
	};

	let payload = event.payload(message_id);
	for webhook in webhooks {
		if !webhook.subscribes_to(event.name()) {
			continue;
		}
		if let Err(err) = store
			.enqueue_webhook_delivery(webhook.id, Some(message_id), event.name(), &payload)
			.await
		{
			warn!(
				webhook_id = %webhook.id,
				%message_id,
				event = event.name(),
				"webhook delivery enqueue failed, dropping: {err}"
			);
		}
	}
}
