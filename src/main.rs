use std::sync::Arc;

use tokio::sync::{Notify, watch};
use tracing::{info, warn};

use courier::{
	config::Config,
	smtp::{DkimCache, SmtpRelay},
	store::{Store, listener::QueueListener},
	telemetry,
	worker::{EmailWorker, WebhookDispatcher},
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = Config::from_env()?;
	let _telemetry = telemetry::init(&config)?;

	let store = Store::connect(&config.database_url, config.worker.concurrency as u32 + 4).await?;
	store.ensure_schema().await?;

	let relay = Arc::new(SmtpRelay::new(config.smtp.clone(), config.hostname.clone()));
	if let Err(err) = relay.verify().await {
		warn!(
			host = %config.smtp.host,
			port = config.smtp.port,
			"SMTP relay verification failed: {err}"
		);
	}

	let message_wake = Arc::new(Notify::new());
	let webhook_wake = Arc::new(Notify::new());
	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let email_worker = EmailWorker::new(
		Arc::new(store.clone()),
		relay.clone(),
		Arc::new(DkimCache::new(config.worker.dkim_cache_ttl)),
		config.hostname.clone(),
		&config.worker,
		message_wake.clone(),
	);
	let dispatcher = WebhookDispatcher::new(
		Arc::new(store.clone()),
		&config.worker,
		webhook_wake.clone(),
	);
	let listener = QueueListener::new(
		store.clone(),
		config.worker.poll_interval,
		config.worker.visibility_timeout,
		message_wake,
		webhook_wake,
	);

	let email_task = tokio::spawn(email_worker.run(shutdown_rx.clone()));
	let webhook_task = tokio::spawn(dispatcher.run(shutdown_rx.clone()));
	let listener_task = tokio::spawn(listener.run(shutdown_rx));

	info!(
		concurrency = config.worker.concurrency,
		poll_interval_ms = config.worker.poll_interval.as_millis() as u64,
		"courier worker up"
	);

	wait_for_shutdown_signal().await;
	info!("shutdown requested, draining in-flight work");
	let _ = shutdown_tx.send(true);

	for task in [email_task, webhook_task, listener_task] {
		let _ = task.await;
	}

	relay.close().await;
	store.close().await;
	info!("courier worker stopped");
	Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
	use tokio::signal::unix::{SignalKind, signal};

	let mut sigterm = match signal(SignalKind::terminate()) {
		Ok(sigterm) => sigterm,
		Err(err) => {
			warn!("SIGTERM handler unavailable: {err}");
			let _ = tokio::signal::ctrl_c().await;
			return;
		}
	};
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {}
		_ = sigterm.recv() => {}
	}
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}
