pub mod listener;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
	ApiKey, Domain, Message, MessageType, Suppression, SuppressionReason, Webhook,
	WebhookDelivery, normalize_address,
};

/// Channel fired by the after-insert trigger on `messages`.
pub const MESSAGE_QUEUED_CHANNEL: &str = "message_queued";
/// Channel fired by the after-insert trigger on `webhook_deliveries`.
pub const WEBHOOK_PENDING_CHANNEL: &str = "webhook_pending";

/// A delivery that failed less than this long ago is not handed out again.
pub const DELIVERY_RECLAIM_GUARD: Duration = Duration::from_secs(30);

const SCHEMA: &str = include_str!("schema.sql");

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("duplicate key: {0}")]
	Duplicate(String),

	#[error("foreign key violation: {0}")]
	ForeignKey(String),

	#[error("database connection lost: {0}")]
	Connection(String),

	#[error("database error: {0}")]
	Unknown(String),
}

impl From<sqlx::Error> for StoreError {
	fn from(err: sqlx::Error) -> Self {
		match &err {
			sqlx::Error::Database(db) => match db.code().as_deref() {
				Some("23505") => StoreError::Duplicate(db.message().to_string()),
				Some("23503") => StoreError::ForeignKey(db.message().to_string()),
				_ => StoreError::Unknown(db.message().to_string()),
			},
			sqlx::Error::Io(_)
			| sqlx::Error::PoolTimedOut
			| sqlx::Error::PoolClosed
			| sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
			_ => StoreError::Unknown(err.to_string()),
		}
	}
}

#[derive(Debug, Clone)]
pub struct NewMessage {
	pub api_key_id: Uuid,
	pub idempotency_key: Option<String>,
	pub kind: MessageType,
	pub from_address: String,
	pub to_address: String,
	pub subject: Option<String>,
	pub body: Option<String>,
	pub html_body: Option<String>,
	pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewWebhook {
	pub api_key_id: Uuid,
	pub url: String,
	pub events: Vec<String>,
	pub secret: String,
}

/// The capability set the email worker and webhook dispatcher depend on.
/// `Store` is the production implementation; tests substitute their own.
#[async_trait]
pub trait MailStore: Send + Sync {
	async fn claim_next_message(&self) -> Result<Option<Message>, StoreError>;
	async fn mark_message_sent(&self, id: Uuid) -> Result<bool, StoreError>;
	async fn requeue_message(&self, id: Uuid, attempts: i32, reason: &str)
	-> Result<bool, StoreError>;
	async fn mark_message_failed(
		&self,
		id: Uuid,
		attempts: i32,
		reason: &str,
	) -> Result<bool, StoreError>;
	async fn mark_message_rejected(&self, id: Uuid, reason: &str) -> Result<bool, StoreError>;
	async fn release_stalled_messages(&self, older_than: Duration) -> Result<u64, StoreError>;

	async fn suppression(
		&self,
		api_key_id: Uuid,
		email: &str,
	) -> Result<Option<Suppression>, StoreError>;
	async fn upsert_suppression(
		&self,
		api_key_id: Uuid,
		email: &str,
		reason: SuppressionReason,
	) -> Result<Suppression, StoreError>;

	async fn sending_domain(
		&self,
		api_key_id: Uuid,
		domain: &str,
	) -> Result<Option<Domain>, StoreError>;

	async fn active_webhooks(&self, api_key_id: Uuid) -> Result<Vec<Webhook>, StoreError>;
	async fn webhook(&self, id: Uuid) -> Result<Option<Webhook>, StoreError>;
	async fn enqueue_webhook_delivery(
		&self,
		webhook_id: Uuid,
		message_id: Option<Uuid>,
		event: &str,
		payload: &serde_json::Value,
	) -> Result<WebhookDelivery, StoreError>;
	async fn claim_next_webhook_delivery(&self) -> Result<Option<WebhookDelivery>, StoreError>;
	async fn mark_delivery_delivered(&self, id: Uuid) -> Result<bool, StoreError>;
	async fn mark_delivery_failed(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[derive(Clone)]
pub struct Store {
	pool: PgPool,
}

impl Store {
	pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
		let pool = PgPoolOptions::new()
			.max_connections(max_connections)
			.connect(database_url)
			.await?;
		Ok(Self { pool })
	}

	pub fn pool(&self) -> &PgPool {
		&self.pool
	}

	/// Applies the bootstrap DDL. Every statement is `IF NOT EXISTS` or
	/// `CREATE OR REPLACE`, so this is safe to run on every start.
	pub async fn ensure_schema(&self) -> Result<(), StoreError> {
		sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
		Ok(())
	}

	pub async fn close(&self) {
		self.pool.close().await;
	}

	pub async fn api_key(&self, id: Uuid) -> Result<Option<ApiKey>, StoreError> {
		sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE id = $1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await
			.map_err(Into::into)
	}

	pub async fn touch_api_key(&self, id: Uuid) -> Result<(), StoreError> {
		sqlx::query("UPDATE api_keys SET last_used_at = now() WHERE id = $1")
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Inserts a message in `queued`. With an idempotency key, a second
	/// insert for the same tenant returns the first row unchanged.
	pub async fn insert_message(&self, new: &NewMessage) -> Result<Message, StoreError> {
		let from_address = normalize_address(&new.from_address);
		let to_address = normalize_address(&new.to_address);

		if let Some(key) = new.idempotency_key.as_deref() {
			let inserted = sqlx::query_as::<_, Message>(
				"INSERT INTO messages \
					(api_key_id, idempotency_key, type, from_address, to_address, subject, body, html_body, metadata) \
				 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
				 ON CONFLICT (api_key_id, idempotency_key) WHERE idempotency_key IS NOT NULL \
					DO NOTHING \
				 RETURNING *",
			)
			.bind(new.api_key_id)
			.bind(key)
			.bind(new.kind)
			.bind(&from_address)
			.bind(&to_address)
			.bind(&new.subject)
			.bind(&new.body)
			.bind(&new.html_body)
			.bind(&new.metadata)
			.fetch_optional(&self.pool)
			.await?;

			if let Some(message) = inserted {
				return Ok(message);
			}
			return sqlx::query_as::<_, Message>(
				"SELECT * FROM messages WHERE api_key_id = $1 AND idempotency_key = $2",
			)
			.bind(new.api_key_id)
			.bind(key)
			.fetch_one(&self.pool)
			.await
			.map_err(Into::into);
		}

		sqlx::query_as::<_, Message>(
			"INSERT INTO messages \
				(api_key_id, type, from_address, to_address, subject, body, html_body, metadata) \
			 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
			 RETURNING *",
		)
		.bind(new.api_key_id)
		.bind(new.kind)
		.bind(&from_address)
		.bind(&to_address)
		.bind(&new.subject)
		.bind(&new.body)
		.bind(&new.html_body)
		.bind(&new.metadata)
		.fetch_one(&self.pool)
		.await
		.map_err(Into::into)
	}

	pub async fn message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
		sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await
			.map_err(Into::into)
	}

	pub async fn create_domain(
		&self,
		api_key_id: Uuid,
		domain: &str,
		dkim_selector: Option<&str>,
		dkim_private_key: Option<&str>,
	) -> Result<Domain, StoreError> {
		sqlx::query_as::<_, Domain>(
			"INSERT INTO domains (api_key_id, domain, dkim_selector, dkim_private_key) \
			 VALUES ($1, lower($2), $3, $4) \
			 RETURNING *",
		)
		.bind(api_key_id)
		.bind(domain)
		.bind(dkim_selector)
		.bind(dkim_private_key)
		.fetch_one(&self.pool)
		.await
		.map_err(Into::into)
	}

	/// One-way transition; a second call is a no-op.
	pub async fn mark_domain_verified(&self, id: Uuid) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"UPDATE domains SET verified = true, verified_at = now() \
			 WHERE id = $1 AND NOT verified",
		)
		.bind(id)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	pub async fn delete_domain(&self, api_key_id: Uuid, domain: &str) -> Result<bool, StoreError> {
		let result =
			sqlx::query("DELETE FROM domains WHERE api_key_id = $1 AND domain = lower($2)")
				.bind(api_key_id)
				.bind(domain)
				.execute(&self.pool)
				.await?;
		Ok(result.rows_affected() > 0)
	}

	pub async fn delete_suppression(
		&self,
		api_key_id: Uuid,
		email: &str,
	) -> Result<bool, StoreError> {
		let result =
			sqlx::query("DELETE FROM suppressions WHERE api_key_id = $1 AND email = $2")
				.bind(api_key_id)
				.bind(normalize_address(email))
				.execute(&self.pool)
				.await?;
		Ok(result.rows_affected() > 0)
	}

	pub async fn create_webhook(&self, new: &NewWebhook) -> Result<Webhook, StoreError> {
		sqlx::query_as::<_, Webhook>(
			"INSERT INTO webhooks (api_key_id, url, events, secret) \
			 VALUES ($1, $2, $3, $4) \
			 RETURNING *",
		)
		.bind(new.api_key_id)
		.bind(&new.url)
		.bind(&new.events)
		.bind(&new.secret)
		.fetch_one(&self.pool)
		.await
		.map_err(Into::into)
	}

	pub async fn delete_webhook(&self, api_key_id: Uuid, id: Uuid) -> Result<bool, StoreError> {
		let result = sqlx::query("DELETE FROM webhooks WHERE id = $1 AND api_key_id = $2")
			.bind(id)
			.bind(api_key_id)
			.execute(&self.pool)
			.await?;
		Ok(result.rows_affected() > 0)
	}
}

#[async_trait]
impl MailStore for Store {
	/// Atomically claims the oldest queued message. `FOR UPDATE SKIP LOCKED`
	/// keeps concurrent claimants from ever colliding on a row.
	async fn claim_next_message(&self) -> Result<Option<Message>, StoreError> {
		sqlx::query_as::<_, Message>(
			"UPDATE messages SET status = 'processing', claimed_at = now() \
			 WHERE id = ( \
				SELECT id FROM messages \
				WHERE status = 'queued' \
				ORDER BY created_at ASC \
				FOR UPDATE SKIP LOCKED \
				LIMIT 1 \
			 ) \
			 RETURNING *",
		)
		.fetch_optional(&self.pool)
		.await
		.map_err(Into::into)
	}

	async fn mark_message_sent(&self, id: Uuid) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"UPDATE messages SET status = 'sent', sent_at = now(), claimed_at = NULL \
			 WHERE id = $1 AND status = 'processing'",
		)
		.bind(id)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	async fn requeue_message(
		&self,
		id: Uuid,
		attempts: i32,
		reason: &str,
	) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"UPDATE messages \
			 SET status = 'queued', attempts = $2, failure_reason = $3, claimed_at = NULL \
			 WHERE id = $1 AND status = 'processing'",
		)
		.bind(id)
		.bind(attempts)
		.bind(reason)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	async fn mark_message_failed(
		&self,
		id: Uuid,
		attempts: i32,
		reason: &str,
	) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"UPDATE messages \
			 SET status = 'failed', attempts = $2, failure_reason = $3, \
				failed_at = now(), claimed_at = NULL \
			 WHERE id = $1 AND status = 'processing'",
		)
		.bind(id)
		.bind(attempts)
		.bind(reason)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	async fn mark_message_rejected(&self, id: Uuid, reason: &str) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"UPDATE messages \
			 SET status = 'rejected', failure_reason = $2, failed_at = now(), claimed_at = NULL \
			 WHERE id = $1 AND status = 'processing'",
		)
		.bind(id)
		.bind(reason)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	/// Returns `processing` rows abandoned by a dead worker to `queued`.
	async fn release_stalled_messages(&self, older_than: Duration) -> Result<u64, StoreError> {
		let result = sqlx::query(
			"UPDATE messages SET status = 'queued', claimed_at = NULL \
			 WHERE status = 'processing' \
			   AND claimed_at < now() - make_interval(secs => $1)",
		)
		.bind(older_than.as_secs_f64())
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}

	async fn suppression(
		&self,
		api_key_id: Uuid,
		email: &str,
	) -> Result<Option<Suppression>, StoreError> {
		sqlx::query_as::<_, Suppression>(
			"SELECT * FROM suppressions WHERE api_key_id = $1 AND email = $2",
		)
		.bind(api_key_id)
		.bind(normalize_address(email))
		.fetch_optional(&self.pool)
		.await
		.map_err(Into::into)
	}

	async fn upsert_suppression(
		&self,
		api_key_id: Uuid,
		email: &str,
		reason: SuppressionReason,
	) -> Result<Suppression, StoreError> {
		sqlx::query_as::<_, Suppression>(
			"INSERT INTO suppressions (api_key_id, email, reason) \
			 VALUES ($1, $2, $3) \
			 ON CONFLICT (api_key_id, email) DO UPDATE SET reason = EXCLUDED.reason \
			 RETURNING *",
		)
		.bind(api_key_id)
		.bind(normalize_address(email))
		.bind(reason)
		.fetch_one(&self.pool)
		.await
		.map_err(Into::into)
	}

	async fn sending_domain(
		&self,
		api_key_id: Uuid,
		domain: &str,
	) -> Result<Option<Domain>, StoreError> {
		sqlx::query_as::<_, Domain>(
			"SELECT * FROM domains WHERE api_key_id = $1 AND domain = lower($2)",
		)
		.bind(api_key_id)
		.bind(domain)
		.fetch_optional(&self.pool)
		.await
		.map_err(Into::into)
	}

	async fn active_webhooks(&self, api_key_id: Uuid) -> Result<Vec<Webhook>, StoreError> {
		sqlx::query_as::<_, Webhook>(
			"SELECT * FROM webhooks WHERE api_key_id = $1 AND active",
		)
		.bind(api_key_id)
		.fetch_all(&self.pool)
		.await
		.map_err(Into::into)
	}

	async fn webhook(&self, id: Uuid) -> Result<Option<Webhook>, StoreError> {
		sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = $1")
			.bind(id)
			.fetch_optional(&self.pool)
			.await
			.map_err(Into::into)
	}

	async fn enqueue_webhook_delivery(
		&self,
		webhook_id: Uuid,
		message_id: Option<Uuid>,
		event: &str,
		payload: &serde_json::Value,
	) -> Result<WebhookDelivery, StoreError> {
		sqlx::query_as::<_, WebhookDelivery>(
			"INSERT INTO webhook_deliveries (webhook_id, message_id, event, payload) \
			 VALUES ($1, $2, $3, $4) \
			 RETURNING *",
		)
		.bind(webhook_id)
		.bind(message_id)
		.bind(event)
		.bind(payload)
		.fetch_one(&self.pool)
		.await
		.map_err(Into::into)
	}

	/// Claims the oldest pending delivery outside the 30-second guard window.
	/// The claim itself advances `attempts` and `last_attempt_at`, so a
	/// dispatcher crash still leaves honest progress accounting.
	async fn claim_next_webhook_delivery(&self) -> Result<Option<WebhookDelivery>, StoreError> {
		sqlx::query_as::<_, WebhookDelivery>(
			"UPDATE webhook_deliveries \
			 SET attempts = attempts + 1, last_attempt_at = now() \
			 WHERE id = ( \
				SELECT id FROM webhook_deliveries \
				WHERE status = 'pending' \
				  AND (last_attempt_at IS NULL OR last_attempt_at < now() - interval '30 seconds') \
				ORDER BY created_at ASC \
				FOR UPDATE SKIP LOCKED \
				LIMIT 1 \
			 ) \
			 RETURNING *",
		)
		.fetch_optional(&self.pool)
		.await
		.map_err(Into::into)
	}

	async fn mark_delivery_delivered(&self, id: Uuid) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"UPDATE webhook_deliveries SET status = 'delivered' \
			 WHERE id = $1 AND status = 'pending'",
		)
		.bind(id)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}

	async fn mark_delivery_failed(&self, id: Uuid) -> Result<bool, StoreError> {
		let result = sqlx::query(
			"UPDATE webhook_deliveries SET status = 'failed' \
			 WHERE id = $1 AND status = 'pending'",
		)
		.bind(id)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected() > 0)
	}
}
