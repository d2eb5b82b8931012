use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{Level, debug, error, event, instrument, warn};

use super::backoff;
use super::sign;
use crate::config::WorkerConfig;
use crate::model::WebhookDelivery;
use crate::store::MailStore;

/// Hard cap per POST, enforced by request cancellation.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

pub const EVENT_HEADER: &str = "X-Courier-Event";
pub const TIMESTAMP_HEADER: &str = "X-Courier-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Courier-Signature";

/// Fans status-change events out to subscriber endpoints: claims pending
/// deliveries, signs the stored payload, POSTs it, and drives the
/// per-delivery retry state machine.
#[derive(Clone)]
pub struct WebhookDispatcher {
	store: Arc<dyn MailStore>,
	http: reqwest::Client,
	concurrency: usize,
	max_retries: u32,
	shutdown_grace: Duration,
	wake: Arc<Notify>,
}

impl WebhookDispatcher {
	pub fn new(store: Arc<dyn MailStore>, worker: &WorkerConfig, wake: Arc<Notify>) -> Self {
		Self {
			store,
			http: reqwest::Client::new(),
			concurrency: worker.concurrency.max(1),
			max_retries: worker.max_webhook_retries,
			shutdown_grace: worker.shutdown_grace,
			wake,
		}
	}

	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		let mut in_flight = JoinSet::new();

		loop {
			tokio::select! {
				_ = self.wake.notified() => {}
				_ = shutdown.wait_for(|stop| *stop) => break,
			}
			self.drain(&mut in_flight, &shutdown).await;
		}

		if tokio::time::timeout(self.shutdown_grace, async {
			while in_flight.join_next().await.is_some() {}
		})
		.await
		.is_err()
		{
			warn!(
				abandoned = in_flight.len(),
				"shutdown grace elapsed with webhook posts still in flight"
			);
			in_flight.abort_all();
		}
	}

	async fn drain(&self, in_flight: &mut JoinSet<()>, shutdown: &watch::Receiver<bool>) {
		loop {
			if *shutdown.borrow() {
				return;
			}
			while in_flight.len() >= self.concurrency {
				in_flight.join_next().await;
			}
			match self.store.claim_next_webhook_delivery().await {
				Ok(Some(delivery)) => {
					let dispatcher = self.clone();
					in_flight.spawn(async move { dispatcher.dispatch(delivery).await });
				}
				Ok(None) => return,
				Err(err) => {
					error!("webhook delivery claim failed: {err}");
					return;
				}
			}
		}
	}

	#[instrument(skip_all, fields(delivery_id = %delivery.id, event = %delivery.event))]
	async fn dispatch(&self, delivery: WebhookDelivery) {
		let webhook = match self.store.webhook(delivery.webhook_id).await {
			Ok(Some(webhook)) => webhook,
			Ok(None) => {
				warn!("parent webhook deleted, failing delivery");
				self.mark_failed(&delivery).await;
				return;
			}
			Err(err) => {
				// Claim already advanced the attempt counter; the 30 s
				// guard spaces the next try.
				error!("webhook lookup failed: {err}");
				return;
			}
		};

		if !webhook.active {
			warn!(webhook_id = %webhook.id, "webhook inactive, failing delivery");
			self.mark_failed(&delivery).await;
			return;
		}

		// A crash between claim and outcome can push a recovered row past
		// the retry budget; never POST for those.
		if delivery.attempts > self.max_retries as i32 {
			warn!(attempts = delivery.attempts, "retry budget exhausted before dispatch");
			self.mark_failed(&delivery).await;
			return;
		}

		let timestamp = Utc::now().timestamp_millis();
		let body = delivery.payload.to_string();
		let signature = sign::header_value(&webhook.secret, timestamp, &body);

		let response = self
			.http
			.post(&webhook.url)
			.timeout(DISPATCH_TIMEOUT)
			.header(CONTENT_TYPE, "application/json")
			.header(EVENT_HEADER, delivery.event.as_str())
			.header(TIMESTAMP_HEADER, timestamp.to_string())
			.header(SIGNATURE_HEADER, signature)
			.body(body)
			.send()
			.await;

		let failure = match response {
			Ok(response) if response.status().is_success() => {
				match self.store.mark_delivery_delivered(delivery.id).await {
					Ok(applied) => event!(
						target: "courier.webhook",
						Level::INFO,
						delivery_id = %delivery.id,
						webhook_id = %webhook.id,
						attempts = delivery.attempts,
						applied,
						outcome = "delivered"
					),
					Err(err) => error!("delivered transition failed: {err}"),
				}
				return;
			}
			Ok(response) => format!("endpoint returned {}", response.status()),
			Err(err) => err.to_string(),
		};

		if delivery.attempts >= self.max_retries as i32 {
			event!(
				target: "courier.webhook",
				Level::ERROR,
				delivery_id = %delivery.id,
				webhook_id = %webhook.id,
				attempts = delivery.attempts,
				outcome = "failed",
				error = %failure
			);
			self.mark_failed(&delivery).await;
			return;
		}

		// The row stays pending with its advanced attempt counter; the
		// claim guard keeps it out of circulation while it cools off.
		let delay = backoff::webhook_retry_delay(delivery.attempts.max(1) as u32 - 1);
		event!(
			target: "courier.webhook",
			Level::WARN,
			delivery_id = %delivery.id,
			webhook_id = %webhook.id,
			attempts = delivery.attempts,
			outcome = "retry",
			eligible_in_ms = delay.as_millis() as u64,
			error = %failure
		);
		debug!("next attempt after claim guard expiry");
	}

	async fn mark_failed(&self, delivery: &WebhookDelivery) {
		if let Err(err) = self.store.mark_delivery_failed(delivery.id).await {
			error!(delivery_id = %delivery.id, "failed transition failed: {err}");
		}
	}
}
