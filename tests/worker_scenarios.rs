mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use uuid::Uuid;

use common::{FakeMailer, MemoryStore, drive_until, worker_config};
use courier::model::{MessageStatus, SuppressionReason};
use courier::smtp::{DkimCache, classify::from_code, SmtpFailure};
use courier::store::MailStore;
use courier::worker::EmailWorker;

fn spawn_worker(
	store: &Arc<MemoryStore>,
	mailer: &Arc<FakeMailer>,
	max_retries: u32,
	wake: &Arc<Notify>,
) -> (watch::Sender<bool>, tokio::task::JoinHandle<()>) {
	let store: Arc<dyn MailStore> = store.clone();
	let worker = EmailWorker::new(
		store,
		mailer.clone(),
		Arc::new(DkimCache::new(Duration::from_secs(60))),
		"courier.test".into(),
		&worker_config(max_retries),
		wake.clone(),
	);
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let handle = tokio::spawn(worker.run(shutdown_rx));
	(shutdown_tx, handle)
}

fn connection_reset() -> SmtpFailure {
	SmtpFailure::connection("connection reset by peer")
}

#[tokio::test]
async fn happy_path_sends_and_emits_sent_event() {
	let store = MemoryStore::new();
	let tenant = Uuid::new_v4();
	let webhook = store.seed_webhook(tenant, "http://hooks.test/", &["message.sent"]);
	let message = store.seed_message(tenant, "mailer@sender.test", "user@receiver.test");
	let mailer = FakeMailer::always_ok();
	let wake = Arc::new(Notify::new());

	let (shutdown, handle) = spawn_worker(&store, &mailer, 3, &wake);
	drive_until(&wake, || {
		store.message(message.id).status == MessageStatus::Sent
	})
	.await;
	let _ = shutdown.send(true);
	handle.await.expect("worker task");

	let final_state = store.message(message.id);
	assert!(final_state.sent_at.is_some());
	assert_eq!(mailer.attempts(), 1);

	let deliveries = store.deliveries();
	assert_eq!(deliveries.len(), 1);
	assert_eq!(deliveries[0].webhook_id, webhook.id);
	assert_eq!(deliveries[0].event, "message.sent");
	assert_eq!(
		deliveries[0].payload["smtpMessageId"],
		format!("<{}@courier.test>", message.id)
	);
}

#[tokio::test]
async fn hard_bounce_fails_suppresses_and_emits_bounced() {
	let store = MemoryStore::new();
	let tenant = Uuid::new_v4();
	store.seed_webhook(tenant, "http://hooks.test/", &["message.bounced", "message.failed"]);
	let message = store.seed_message(tenant, "mailer@sender.test", "Gone@Example.com");
	let mailer = FakeMailer::scripted(vec![Err(from_code(
		550,
		"550 5.1.1 user unknown".into(),
	))]);
	let wake = Arc::new(Notify::new());

	let (shutdown, handle) = spawn_worker(&store, &mailer, 3, &wake);
	drive_until(&wake, || {
		store.message(message.id).status == MessageStatus::Failed
	})
	.await;
	let _ = shutdown.send(true);
	handle.await.expect("worker task");

	let final_state = store.message(message.id);
	assert_eq!(final_state.attempts, 1);
	assert!(final_state.failed_at.is_some());

	let suppressions = store.suppressions();
	assert_eq!(suppressions.len(), 1);
	assert_eq!(suppressions[0].email, "gone@example.com");
	assert_eq!(suppressions[0].reason, SuppressionReason::HardBounce);

	let deliveries = store.deliveries();
	assert_eq!(deliveries.len(), 1);
	assert_eq!(deliveries[0].event, "message.bounced");
	assert_eq!(deliveries[0].payload["bounceCode"], 550);
	assert_eq!(deliveries[0].payload["bounceType"], "hard");
}

#[tokio::test]
async fn transient_failure_then_success_retries_once() {
	let store = MemoryStore::new();
	let tenant = Uuid::new_v4();
	store.seed_webhook(tenant, "http://hooks.test/", &["message.sent"]);
	let message = store.seed_message(tenant, "mailer@sender.test", "user@receiver.test");
	let mailer = FakeMailer::scripted(vec![Err(connection_reset()), Ok(())]);
	let wake = Arc::new(Notify::new());

	let (shutdown, handle) = spawn_worker(&store, &mailer, 3, &wake);
	drive_until(&wake, || {
		store.message(message.id).status == MessageStatus::Sent
	})
	.await;
	let _ = shutdown.send(true);
	handle.await.expect("worker task");

	assert_eq!(store.message(message.id).attempts, 1);
	assert_eq!(mailer.attempts(), 2);
	let deliveries = store.deliveries();
	assert_eq!(deliveries.len(), 1);
	assert_eq!(deliveries[0].event, "message.sent");
}

#[tokio::test]
async fn exhausted_retries_end_failed_without_suppression() {
	let store = MemoryStore::new();
	let tenant = Uuid::new_v4();
	store.seed_webhook(
		tenant,
		"http://hooks.test/",
		&["message.failed", "message.bounced"],
	);
	let message = store.seed_message(tenant, "mailer@sender.test", "user@receiver.test");
	let temporary = || Err(from_code(421, "421 service not available".into()));
	let mailer = FakeMailer::scripted(vec![temporary(), temporary(), temporary()]);
	let wake = Arc::new(Notify::new());

	let (shutdown, handle) = spawn_worker(&store, &mailer, 3, &wake);
	drive_until(&wake, || {
		store.message(message.id).status == MessageStatus::Failed
	})
	.await;
	let _ = shutdown.send(true);
	handle.await.expect("worker task");

	let final_state = store.message(message.id);
	assert_eq!(final_state.attempts, 3);
	assert_eq!(mailer.attempts(), 3);
	assert!(store.suppressions().is_empty());

	let deliveries = store.deliveries();
	assert_eq!(deliveries.len(), 1);
	assert_eq!(deliveries[0].event, "message.failed");
	assert_eq!(
		deliveries[0].payload["failureReason"],
		"421 service not available"
	);
}

#[tokio::test]
async fn suppressed_recipient_is_rejected_without_a_send() {
	let store = MemoryStore::new();
	let tenant = Uuid::new_v4();
	store.seed_webhook(tenant, "http://hooks.test/", &["message.sent", "message.failed"]);
	store.seed_suppression(tenant, "x@y.test", SuppressionReason::Manual);
	let message = store.seed_message(tenant, "mailer@sender.test", "X@Y.test");
	let mailer = FakeMailer::always_ok();
	let wake = Arc::new(Notify::new());

	let (shutdown, handle) = spawn_worker(&store, &mailer, 3, &wake);
	drive_until(&wake, || {
		store.message(message.id).status == MessageStatus::Rejected
	})
	.await;
	let _ = shutdown.send(true);
	handle.await.expect("worker task");

	let final_state = store.message(message.id);
	assert_eq!(
		final_state.failure_reason.as_deref(),
		Some("Recipient suppressed: manual")
	);
	assert_eq!(mailer.attempts(), 0);
	assert!(store.deliveries().is_empty());
}

#[tokio::test]
async fn zero_max_retries_makes_the_first_failure_terminal() {
	let store = MemoryStore::new();
	let tenant = Uuid::new_v4();
	let message = store.seed_message(tenant, "mailer@sender.test", "user@receiver.test");
	let mailer = FakeMailer::scripted(vec![Err(connection_reset())]);
	let wake = Arc::new(Notify::new());

	let (shutdown, handle) = spawn_worker(&store, &mailer, 0, &wake);
	drive_until(&wake, || {
		store.message(message.id).status == MessageStatus::Failed
	})
	.await;
	let _ = shutdown.send(true);
	handle.await.expect("worker task");

	assert_eq!(store.message(message.id).attempts, 1);
	assert_eq!(mailer.attempts(), 1);
}

#[tokio::test]
async fn retries_never_decrease_attempts() {
	let store = MemoryStore::new();
	let tenant = Uuid::new_v4();
	let message = store.seed_message(tenant, "mailer@sender.test", "user@receiver.test");
	let mailer = FakeMailer::scripted(vec![
		Err(connection_reset()),
		Err(connection_reset()),
		Ok(()),
	]);
	let wake = Arc::new(Notify::new());

	let (shutdown, handle) = spawn_worker(&store, &mailer, 5, &wake);
	let mut observed = Vec::new();
	drive_until(&wake, || {
		observed.push(store.message(message.id).attempts);
		store.message(message.id).status == MessageStatus::Sent
	})
	.await;
	let _ = shutdown.send(true);
	handle.await.expect("worker task");

	assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
	assert_eq!(store.message(message.id).attempts, 2);
}

#[tokio::test]
async fn unsubscribed_webhooks_see_nothing() {
	let store = MemoryStore::new();
	let tenant = Uuid::new_v4();
	store.seed_webhook(tenant, "http://hooks.test/", &["message.bounced"]);
	let message = store.seed_message(tenant, "mailer@sender.test", "user@receiver.test");
	let mailer = FakeMailer::always_ok();
	let wake = Arc::new(Notify::new());

	let (shutdown, handle) = spawn_worker(&store, &mailer, 3, &wake);
	drive_until(&wake, || {
		store.message(message.id).status == MessageStatus::Sent
	})
	.await;
	let _ = shutdown.send(true);
	handle.await.expect("worker task");

	assert!(store.deliveries().is_empty());
}
