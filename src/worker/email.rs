use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tracing::{Level, debug, error, event, instrument, warn};

use super::backoff;
use super::events::{self, MessageEvent};
use crate::config::WorkerConfig;
use crate::model::{Message, MessageType, SuppressionReason, normalize_address};
use crate::smtp::{DkimCache, Mailer, SendRequest, SmtpFailure};
use crate::store::MailStore;

/// Drives queued messages through the send state machine:
/// `queued → processing → {sent, queued, failed, rejected}`.
#[derive(Clone)]
pub struct EmailWorker {
	store: Arc<dyn MailStore>,
	mailer: Arc<dyn Mailer>,
	dkim: Arc<DkimCache>,
	hostname: String,
	concurrency: usize,
	max_retries: u32,
	retry_delay: Duration,
	shutdown_grace: Duration,
	wake: Arc<Notify>,
}

impl EmailWorker {
	pub fn new(
		store: Arc<dyn MailStore>,
		mailer: Arc<dyn Mailer>,
		dkim: Arc<DkimCache>,
		hostname: String,
		worker: &WorkerConfig,
		wake: Arc<Notify>,
	) -> Self {
		Self {
			store,
			mailer,
			dkim,
			hostname,
			concurrency: worker.concurrency.max(1),
			max_retries: worker.max_retries,
			retry_delay: worker.retry_delay,
			shutdown_grace: worker.shutdown_grace,
			wake,
		}
	}

	/// Runs until shutdown. Each wake-up drains the queue: claims are taken
	/// until one comes back empty, with up to `concurrency` sends in flight.
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		let mut in_flight = JoinSet::new();

		loop {
			tokio::select! {
				_ = self.wake.notified() => {}
				_ = shutdown.wait_for(|stop| *stop) => break,
			}
			self.drain(&mut in_flight, &shutdown).await;
		}

		// Let in-flight sends finish inside the grace window; anything
		// still running is abandoned and re-picked up after restart by
		// the visibility-timeout sweep.
		let grace = self.shutdown_grace;
		if tokio::time::timeout(grace, async {
			while in_flight.join_next().await.is_some() {}
		})
		.await
		.is_err()
		{
			warn!(
				abandoned = in_flight.len(),
				"shutdown grace elapsed with sends still in flight"
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
			match self.store.claim_next_message().await {
				Ok(Some(message)) => {
					let worker = self.clone();
					in_flight.spawn(async move { worker.process(message).await });
				}
				Ok(None) => return,
				Err(err) => {
					error!("message claim failed: {err}");
					return;
				}
			}
		}
	}

	#[instrument(skip_all, fields(message_id = %message.id, tenant = %message.api_key_id))]
	async fn process(&self, message: Message) {
		if message.kind != MessageType::Email {
			self.finish_failed(&message, message.attempts + 1, "unsupported message type", None)
				.await;
			return;
		}

		let recipient = normalize_address(&message.to_address);

		// Re-checked post-claim: the suppression may have been created
		// after this message was accepted.
		match self.store.suppression(message.api_key_id, &recipient).await {
			Ok(Some(suppression)) => {
				let reason = format!("Recipient suppressed: {}", suppression.reason.as_str());
				match self.store.mark_message_rejected(message.id, &reason).await {
					Ok(applied) => event!(
						target: "courier.worker",
						Level::INFO,
						message_id = %message.id,
						outcome = "rejected",
						applied,
						reason = %reason
					),
					Err(err) => error!("rejected transition failed: {err}"),
				}
				return;
			}
			Ok(None) => {}
			Err(err) => {
				// Leave the claim in place; the visibility-timeout sweep
				// returns the row to the queue.
				error!("suppression lookup failed: {err}");
				return;
			}
		}

		let dkim = self
			.dkim
			.resolve(self.store.as_ref(), message.api_key_id, &message.from_address)
			.await;

		let request = SendRequest {
			message_id: format!("{}@{}", message.id, self.hostname),
			from: message.from_address.clone(),
			to: recipient.clone(),
			subject: message.subject.clone(),
			text_body: message.body.clone(),
			html_body: message.html_body.clone(),
		};

		match self.mailer.send(&request, dkim.as_ref()).await {
			Ok(outcome) => {
				match self.store.mark_message_sent(message.id).await {
					Ok(true) => {
						event!(
							target: "courier.worker",
							Level::INFO,
							message_id = %message.id,
							outcome = "sent",
							smtp_id = %outcome.smtp_id
						);
						events::emit(
							self.store.as_ref(),
							message.api_key_id,
							message.id,
							&MessageEvent::Sent {
								smtp_id: outcome.smtp_id,
							},
						)
						.await;
					}
					Ok(false) => warn!("message no longer processing, skipping sent transition"),
					Err(err) => error!("sent transition failed: {err}"),
				}
			}
			Err(failure) => self.handle_failure(&message, &recipient, failure).await,
		}
	}

	async fn handle_failure(&self, message: &Message, recipient: &str, failure: SmtpFailure) {
		let attempts = message.attempts + 1;
		let should_retry = failure.should_retry() && (attempts as u32) < self.max_retries;

		if should_retry {
			let delay = backoff::message_retry_delay(self.retry_delay, attempts as u32);
			match self
				.store
				.requeue_message(message.id, attempts, &failure.to_string())
				.await
			{
				Ok(applied) => event!(
					target: "courier.worker",
					Level::WARN,
					message_id = %message.id,
					outcome = "retry",
					attempts,
					applied,
					eligible_in_ms = delay.as_millis() as u64,
					error = %failure
				),
				Err(err) => error!("retry transition failed: {err}"),
			}
			return;
		}

		let hard_bounce = failure.is_hard_bounce();
		let applied = self
			.finish_failed(message, attempts, &failure.to_string(), failure.code)
			.await;
		if !applied {
			return;
		}

		if hard_bounce {
			// Every hard-bounce terminal transition leaves a suppression
			// behind, absent a store error.
			if let Err(err) = self
				.store
				.upsert_suppression(message.api_key_id, recipient, SuppressionReason::HardBounce)
				.await
			{
				error!("hard bounce suppression upsert failed: {err}");
			}
			events::emit(
				self.store.as_ref(),
				message.api_key_id,
				message.id,
				&MessageEvent::Bounced {
					code: failure.code,
					description: failure.message.clone(),
				},
			)
			.await;
		} else {
			events::emit(
				self.store.as_ref(),
				message.api_key_id,
				message.id,
				&MessageEvent::Failed {
					reason: failure.message.clone(),
				},
			)
			.await;
		}
	}

	async fn finish_failed(
		&self,
		message: &Message,
		attempts: i32,
		reason: &str,
		code: Option<u16>,
	) -> bool {
		match self
			.store
			.mark_message_failed(message.id, attempts, reason)
			.await
		{
			Ok(applied) => {
				event!(
					target: "courier.worker",
					Level::ERROR,
					message_id = %message.id,
					outcome = "failed",
					attempts,
					applied,
					code = code.map(|c| c as i64),
					reason
				);
				if !applied {
					debug!("message left processing before failed transition applied");
				}
				applied
			}
			Err(err) => {
				error!("failed transition failed: {err}");
				false
			}
		}
	}
}
