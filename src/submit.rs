use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::model::{Message, MessageType, address_domain, normalize_address};
use crate::rate_limit::RateLimiter;
use crate::store::{MailStore, NewMessage, Store, StoreError};

/// A message submission as the HTTP API hands it to the core, already
/// deserialized but not yet validated.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
	pub api_key_id: Uuid,
	pub idempotency_key: Option<String>,
	pub from: String,
	pub to: String,
	pub subject: Option<String>,
	pub body: Option<String>,
	pub html_body: Option<String>,
	pub metadata: Option<Value>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
	#[error("unknown API key")]
	UnknownTenant,

	#[error("rate limit exceeded")]
	RateLimited,

	#[error("invalid sender address: {0}")]
	InvalidSender(String),

	#[error("invalid recipient address: {0}")]
	InvalidRecipient(String),

	#[error("sending domain {0} is not registered for this API key")]
	UnknownDomain(String),

	#[error("sending domain {0} is not verified")]
	UnverifiedDomain(String),

	#[error("recipient is suppressed: {0}")]
	Suppressed(&'static str),

	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Validates and enqueues one message. Every rejection here happens before
/// the row exists, so the caller gets a synchronous error and the queue
/// never sees the message. With an idempotency key, resubmission returns
/// the original row untouched.
#[instrument(skip_all, fields(tenant = %request.api_key_id, to = %request.to))]
pub async fn submit_message(
	store: &Store,
	limiter: &RateLimiter,
	request: SubmitRequest,
) -> Result<Message, SubmitError> {
	let api_key = store
		.api_key(request.api_key_id)
		.await?
		.ok_or(SubmitError::UnknownTenant)?;

	if !limiter.allow(api_key.id, api_key.rate_limit_per_second.max(0) as u32) {
		return Err(SubmitError::RateLimited);
	}

	let from = normalize_address(&request.from);
	let sender_domain = address_domain(&from)
		.ok_or_else(|| SubmitError::InvalidSender(request.from.clone()))?
		.to_string();

	let to = normalize_address(&request.to);
	if address_domain(&to).is_none() {
		return Err(SubmitError::InvalidRecipient(request.to.clone()));
	}

	let domain = store
		.sending_domain(api_key.id, &sender_domain)
		.await?
		.ok_or_else(|| SubmitError::UnknownDomain(sender_domain.clone()))?;
	if !domain.verified {
		return Err(SubmitError::UnverifiedDomain(sender_domain));
	}

	if let Some(suppression) = store.suppression(api_key.id, &to).await? {
		return Err(SubmitError::Suppressed(suppression.reason.as_str()));
	}

	let message = store
		.insert_message(&NewMessage {
			api_key_id: api_key.id,
			idempotency_key: request.idempotency_key,
			kind: MessageType::Email,
			from_address: from,
			to_address: to,
			subject: request.subject,
			body: request.body,
			html_body: request.html_body,
			metadata: request.metadata.unwrap_or_else(|| Value::Object(Default::default())),
		})
		.await?;

	if let Err(err) = store.touch_api_key(api_key.id).await {
		warn!("api key touch failed: {err}");
	}

	Ok(message)
}
