use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgListener;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use super::{MESSAGE_QUEUED_CHANNEL, MailStore, Store, WEBHOOK_PENDING_CHANNEL};

/// Wires the store's publish-notify channels to the worker wake-ups, with a
/// timed poll as the safety net. Notifications are advisory: losing one only
/// costs latency, because every poll tick fires both wake-ups anyway.
pub struct QueueListener {
	store: Store,
	poll_interval: Duration,
	visibility_timeout: Duration,
	message_wake: Arc<Notify>,
	webhook_wake: Arc<Notify>,
}

impl QueueListener {
	pub fn new(
		store: Store,
		poll_interval: Duration,
		visibility_timeout: Duration,
		message_wake: Arc<Notify>,
		webhook_wake: Arc<Notify>,
	) -> Self {
		Self {
			store,
			poll_interval: poll_interval.max(Duration::from_secs(1)),
			visibility_timeout,
			message_wake,
			webhook_wake,
		}
	}

	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		// Initial sweep: drain whatever accumulated while we were down.
		self.tick().await;

		match self.subscribe().await {
			Ok(listener) => self.run_with_listener(listener, &mut shutdown).await,
			Err(err) => {
				warn!("queue notifications unavailable, falling back to polling only: {err}");
				self.run_poll_only(&mut shutdown).await;
			}
		}
	}

	async fn subscribe(&self) -> Result<PgListener, sqlx::Error> {
		let mut listener = PgListener::connect_with(self.store.pool()).await?;
		listener
			.listen_all([MESSAGE_QUEUED_CHANNEL, WEBHOOK_PENDING_CHANNEL])
			.await?;
		info!(
			channels = ?[MESSAGE_QUEUED_CHANNEL, WEBHOOK_PENDING_CHANNEL],
			"queue listener subscribed"
		);
		Ok(listener)
	}

	async fn run_with_listener(
		&self,
		mut listener: PgListener,
		shutdown: &mut watch::Receiver<bool>,
	) {
		let mut poll = tokio::time::interval(self.poll_interval);
		poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		poll.reset();

		loop {
			tokio::select! {
				notification = listener.recv() => match notification {
					Ok(notification) => {
						debug!(
							channel = notification.channel(),
							payload = notification.payload(),
							"queue notification"
						);
						match notification.channel() {
							MESSAGE_QUEUED_CHANNEL => self.message_wake.notify_one(),
							WEBHOOK_PENDING_CHANNEL => self.webhook_wake.notify_one(),
							other => warn!("notification on unexpected channel {other}"),
						}
					}
					// recv re-establishes the connection on the next call;
					// the poll tick covers anything missed in between.
					Err(err) => warn!("queue notification stream error: {err}"),
				},
				_ = poll.tick() => self.tick().await,
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						info!("queue listener stopping");
						return;
					}
				}
			}
		}
	}

	async fn run_poll_only(&self, shutdown: &mut watch::Receiver<bool>) {
		let mut poll = tokio::time::interval(self.poll_interval);
		poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				_ = poll.tick() => self.tick().await,
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						info!("queue listener stopping");
						return;
					}
				}
			}
		}
	}

	/// One safety-net pass: reset abandoned claims, then wake both workers
	/// unconditionally. Covers lost notifications, worker restarts, and
	/// retry rows waiting out their back-off.
	async fn tick(&self) {
		match self
			.store
			.release_stalled_messages(self.visibility_timeout)
			.await
		{
			Ok(0) => {}
			Ok(released) => warn!(released, "reset stalled processing messages"),
			Err(err) => error!("stalled message sweep failed: {err}"),
		}
		self.message_wake.notify_one();
		self.webhook_wake.notify_one();
	}
}
