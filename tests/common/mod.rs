#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use courier::config::WorkerConfig;
use courier::model::{
	DeliveryStatus, Domain, Message, MessageStatus, MessageType, Suppression, SuppressionReason,
	Webhook, WebhookDelivery, normalize_address,
};
use courier::smtp::{DkimKey, Mailer, SendOutcome, SendRequest, SmtpFailure};
use courier::store::{MailStore, StoreError};

pub fn worker_config(max_retries: u32) -> WorkerConfig {
	WorkerConfig {
		concurrency: 2,
		max_retries,
		retry_delay: Duration::from_millis(1),
		poll_interval: Duration::from_millis(50),
		max_webhook_retries: 5,
		visibility_timeout: Duration::from_secs(1),
		shutdown_grace: Duration::from_secs(1),
		dkim_cache_ttl: Duration::from_secs(60),
		debug: false,
	}
}

/// Pokes the worker the way the poller would until `done` holds.
pub async fn drive_until(wake: &Notify, mut done: impl FnMut() -> bool) {
	for _ in 0..100 {
		if done() {
			return;
		}
		wake.notify_one();
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	panic!("condition not reached within 5s");
}

#[derive(Default)]
struct Inner {
	messages: Vec<Message>,
	suppressions: Vec<Suppression>,
	domains: Vec<Domain>,
	webhooks: Vec<Webhook>,
	deliveries: Vec<WebhookDelivery>,
}

/// In-memory stand-in for the Postgres store, substituting through the
/// `MailStore` seam. Mirrors the production claim and terminal-guard
/// semantics, including the 30-second delivery re-claim guard.
#[derive(Default)]
pub struct MemoryStore {
	inner: Mutex<Inner>,
}

impl MemoryStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn seed_message(&self, api_key_id: Uuid, from: &str, to: &str) -> Message {
		let message = Message {
			id: Uuid::new_v4(),
			api_key_id,
			idempotency_key: None,
			kind: MessageType::Email,
			status: MessageStatus::Queued,
			from_address: normalize_address(from),
			to_address: normalize_address(to),
			subject: Some("Integration Test".into()),
			body: Some("Hello recipient".into()),
			html_body: None,
			metadata: serde_json::json!({}),
			attempts: 0,
			failure_reason: None,
			created_at: Utc::now(),
			claimed_at: None,
			sent_at: None,
			delivered_at: None,
			failed_at: None,
		};
		self.inner
			.lock()
			.expect("store lock")
			.messages
			.push(message.clone());
		message
	}

	pub fn seed_suppression(&self, api_key_id: Uuid, email: &str, reason: SuppressionReason) {
		let suppression = Suppression {
			id: Uuid::new_v4(),
			api_key_id,
			email: normalize_address(email),
			reason,
			created_at: Utc::now(),
		};
		self.inner
			.lock()
			.expect("store lock")
			.suppressions
			.push(suppression);
	}

	pub fn seed_webhook(&self, api_key_id: Uuid, url: &str, events: &[&str]) -> Webhook {
		let webhook = Webhook {
			id: Uuid::new_v4(),
			api_key_id,
			url: url.to_string(),
			events: events.iter().map(|e| e.to_string()).collect(),
			secret: "whsec_test".into(),
			active: true,
			created_at: Utc::now(),
		};
		self.inner
			.lock()
			.expect("store lock")
			.webhooks
			.push(webhook.clone());
		webhook
	}

	pub fn deactivate_webhook(&self, id: Uuid) {
		let mut inner = self.inner.lock().expect("store lock");
		if let Some(webhook) = inner.webhooks.iter_mut().find(|w| w.id == id) {
			webhook.active = false;
		}
	}

	pub fn remove_webhook(&self, id: Uuid) {
		self.inner
			.lock()
			.expect("store lock")
			.webhooks
			.retain(|w| w.id != id);
	}

	pub fn seed_delivery(&self, webhook_id: Uuid, event: &str, payload: serde_json::Value) -> Uuid {
		let delivery = WebhookDelivery {
			id: Uuid::new_v4(),
			webhook_id,
			message_id: None,
			event: event.to_string(),
			payload,
			status: DeliveryStatus::Pending,
			attempts: 0,
			last_attempt_at: None,
			created_at: Utc::now(),
		};
		let id = delivery.id;
		self.inner
			.lock()
			.expect("store lock")
			.deliveries
			.push(delivery);
		id
	}

	pub fn message(&self, id: Uuid) -> Message {
		self.inner
			.lock()
			.expect("store lock")
			.messages
			.iter()
			.find(|m| m.id == id)
			.expect("message exists")
			.clone()
	}

	pub fn delivery(&self, id: Uuid) -> WebhookDelivery {
		self.inner
			.lock()
			.expect("store lock")
			.deliveries
			.iter()
			.find(|d| d.id == id)
			.expect("delivery exists")
			.clone()
	}

	pub fn deliveries(&self) -> Vec<WebhookDelivery> {
		self.inner.lock().expect("store lock").deliveries.clone()
	}

	pub fn suppressions(&self) -> Vec<Suppression> {
		self.inner.lock().expect("store lock").suppressions.clone()
	}

	/// Ages every pending delivery past the re-claim guard, standing in for
	/// the wall-clock the production store consults.
	pub fn expire_delivery_guard(&self) {
		let mut inner = self.inner.lock().expect("store lock");
		for delivery in &mut inner.deliveries {
			if delivery.status == DeliveryStatus::Pending && delivery.last_attempt_at.is_some() {
				delivery.last_attempt_at = Some(Utc::now() - ChronoDuration::seconds(31));
			}
		}
	}
}

#[async_trait]
impl MailStore for MemoryStore {
	async fn claim_next_message(&self) -> Result<Option<Message>, StoreError> {
		let mut inner = self.inner.lock().expect("store lock");
		let claimed = inner
			.messages
			.iter_mut()
			.filter(|m| m.status == MessageStatus::Queued)
			.min_by_key(|m| m.created_at);
		Ok(claimed.map(|message| {
			message.status = MessageStatus::Processing;
			message.claimed_at = Some(Utc::now());
			message.clone()
		}))
	}

	async fn mark_message_sent(&self, id: Uuid) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().expect("store lock");
		Ok(inner
			.messages
			.iter_mut()
			.find(|m| m.id == id && m.status == MessageStatus::Processing)
			.map(|m| {
				m.status = MessageStatus::Sent;
				m.sent_at = Some(Utc::now());
				m.claimed_at = None;
			})
			.is_some())
	}

	async fn requeue_message(
		&self,
		id: Uuid,
		attempts: i32,
		reason: &str,
	) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().expect("store lock");
		Ok(inner
			.messages
			.iter_mut()
			.find(|m| m.id == id && m.status == MessageStatus::Processing)
			.map(|m| {
				m.status = MessageStatus::Queued;
				m.attempts = attempts;
				m.failure_reason = Some(reason.to_string());
				m.claimed_at = None;
			})
			.is_some())
	}

	async fn mark_message_failed(
		&self,
		id: Uuid,
		attempts: i32,
		reason: &str,
	) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().expect("store lock");
		Ok(inner
			.messages
			.iter_mut()
			.find(|m| m.id == id && m.status == MessageStatus::Processing)
			.map(|m| {
				m.status = MessageStatus::Failed;
				m.attempts = attempts;
				m.failure_reason = Some(reason.to_string());
				m.failed_at = Some(Utc::now());
				m.claimed_at = None;
			})
			.is_some())
	}

	async fn mark_message_rejected(&self, id: Uuid, reason: &str) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().expect("store lock");
		Ok(inner
			.messages
			.iter_mut()
			.find(|m| m.id == id && m.status == MessageStatus::Processing)
			.map(|m| {
				m.status = MessageStatus::Rejected;
				m.failure_reason = Some(reason.to_string());
				m.failed_at = Some(Utc::now());
				m.claimed_at = None;
			})
			.is_some())
	}

	async fn release_stalled_messages(&self, older_than: Duration) -> Result<u64, StoreError> {
		let cutoff = Utc::now()
			- ChronoDuration::from_std(older_than).unwrap_or(ChronoDuration::seconds(0));
		let mut inner = self.inner.lock().expect("store lock");
		let mut released = 0;
		for message in &mut inner.messages {
			if message.status == MessageStatus::Processing
				&& message.claimed_at.is_some_and(|at| at < cutoff)
			{
				message.status = MessageStatus::Queued;
				message.claimed_at = None;
				released += 1;
			}
		}
		Ok(released)
	}

	async fn suppression(
		&self,
		api_key_id: Uuid,
		email: &str,
	) -> Result<Option<Suppression>, StoreError> {
		let email = normalize_address(email);
		let inner = self.inner.lock().expect("store lock");
		Ok(inner
			.suppressions
			.iter()
			.find(|s| s.api_key_id == api_key_id && s.email == email)
			.cloned())
	}

	async fn upsert_suppression(
		&self,
		api_key_id: Uuid,
		email: &str,
		reason: SuppressionReason,
	) -> Result<Suppression, StoreError> {
		let email = normalize_address(email);
		let mut inner = self.inner.lock().expect("store lock");
		if let Some(existing) = inner
			.suppressions
			.iter_mut()
			.find(|s| s.api_key_id == api_key_id && s.email == email)
		{
			existing.reason = reason;
			return Ok(existing.clone());
		}
		let suppression = Suppression {
			id: Uuid::new_v4(),
			api_key_id,
			email,
			reason,
			created_at: Utc::now(),
		};
		inner.suppressions.push(suppression.clone());
		Ok(suppression)
	}

	async fn sending_domain(
		&self,
		api_key_id: Uuid,
		domain: &str,
	) -> Result<Option<Domain>, StoreError> {
		let domain = domain.to_ascii_lowercase();
		let inner = self.inner.lock().expect("store lock");
		Ok(inner
			.domains
			.iter()
			.find(|d| d.api_key_id == api_key_id && d.domain == domain)
			.cloned())
	}

	async fn active_webhooks(&self, api_key_id: Uuid) -> Result<Vec<Webhook>, StoreError> {
		let inner = self.inner.lock().expect("store lock");
		Ok(inner
			.webhooks
			.iter()
			.filter(|w| w.api_key_id == api_key_id && w.active)
			.cloned()
			.collect())
	}

	async fn webhook(&self, id: Uuid) -> Result<Option<Webhook>, StoreError> {
		let inner = self.inner.lock().expect("store lock");
		Ok(inner.webhooks.iter().find(|w| w.id == id).cloned())
	}

	async fn enqueue_webhook_delivery(
		&self,
		webhook_id: Uuid,
		message_id: Option<Uuid>,
		event: &str,
		payload: &serde_json::Value,
	) -> Result<WebhookDelivery, StoreError> {
		let delivery = WebhookDelivery {
			id: Uuid::new_v4(),
			webhook_id,
			message_id,
			event: event.to_string(),
			payload: payload.clone(),
			status: DeliveryStatus::Pending,
			attempts: 0,
			last_attempt_at: None,
			created_at: Utc::now(),
		};
		self.inner
			.lock()
			.expect("store lock")
			.deliveries
			.push(delivery.clone());
		Ok(delivery)
	}

	async fn claim_next_webhook_delivery(&self) -> Result<Option<WebhookDelivery>, StoreError> {
		let guard_cutoff = Utc::now() - ChronoDuration::seconds(30);
		let mut inner = self.inner.lock().expect("store lock");
		let claimed = inner
			.deliveries
			.iter_mut()
			.filter(|d| {
				d.status == DeliveryStatus::Pending
					&& d.last_attempt_at.is_none_or(|at| at < guard_cutoff)
			})
			.min_by_key(|d| d.created_at);
		Ok(claimed.map(|delivery| {
			delivery.attempts += 1;
			delivery.last_attempt_at = Some(Utc::now());
			delivery.clone()
		}))
	}

	async fn mark_delivery_delivered(&self, id: Uuid) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().expect("store lock");
		Ok(inner
			.deliveries
			.iter_mut()
			.find(|d| d.id == id && d.status == DeliveryStatus::Pending)
			.map(|d| d.status = DeliveryStatus::Delivered)
			.is_some())
	}

	async fn mark_delivery_failed(&self, id: Uuid) -> Result<bool, StoreError> {
		let mut inner = self.inner.lock().expect("store lock");
		Ok(inner
			.deliveries
			.iter_mut()
			.find(|d| d.id == id && d.status == DeliveryStatus::Pending)
			.map(|d| d.status = DeliveryStatus::Failed)
			.is_some())
	}
}

/// Transport fake with a scripted outcome per attempt; once the script is
/// exhausted every further send succeeds.
pub struct FakeMailer {
	script: Mutex<VecDeque<Result<(), SmtpFailure>>>,
	sent: Mutex<Vec<SendRequest>>,
}

impl FakeMailer {
	pub fn scripted(outcomes: Vec<Result<(), SmtpFailure>>) -> Arc<Self> {
		Arc::new(Self {
			script: Mutex::new(outcomes.into()),
			sent: Mutex::new(Vec::new()),
		})
	}

	pub fn always_ok() -> Arc<Self> {
		Self::scripted(Vec::new())
	}

	pub fn attempts(&self) -> usize {
		self.sent.lock().expect("mailer lock").len()
	}

	pub fn requests(&self) -> Vec<SendRequest> {
		self.sent.lock().expect("mailer lock").clone()
	}
}

#[async_trait]
impl Mailer for FakeMailer {
	async fn send(
		&self,
		request: &SendRequest,
		_dkim: Option<&DkimKey>,
	) -> Result<SendOutcome, SmtpFailure> {
		self.sent.lock().expect("mailer lock").push(request.clone());
		match self.script.lock().expect("mailer lock").pop_front() {
			None | Some(Ok(())) => Ok(SendOutcome {
				smtp_id: format!("<{}>", request.message_id),
			}),
			Some(Err(failure)) => Err(failure),
		}
	}
}
