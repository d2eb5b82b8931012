use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mail_auth::{
	common::crypto::{RsaKey, Sha256},
	dkim::DkimSigner,
};
use mail_builder::MessageBuilder;
use mail_send::{SmtpClient, SmtpClientBuilder, smtp::message::Message};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tokio_rustls::client::TlsStream;
use tracing::{debug, instrument, warn};

use super::classify::{SmtpFailure, classify};
use super::dkim::DkimKey;
use super::{Mailer, SendOutcome, SendRequest};
use crate::config::{SmtpConfig, TlsMode};

/// Connections idle longer than this are discarded at checkout rather than
/// risking a send on a socket the relay may have dropped.
const MAX_IDLE: Duration = Duration::from_secs(60);

enum RelayConnection {
	Tls(SmtpClient<TlsStream<TcpStream>>),
	Plain(SmtpClient<TcpStream>),
}

impl RelayConnection {
	async fn send_message(
		&mut self,
		mail: Message<'_>,
		signer: Option<&DkimSigner<RsaKey<Sha256>, mail_auth::dkim::Done>>,
	) -> Result<(), mail_send::Error> {
		match self {
			RelayConnection::Tls(client) => send_with_client(client, mail, signer).await,
			RelayConnection::Plain(client) => send_with_client(client, mail, signer).await,
		}
	}
}

async fn send_with_client<T: AsyncRead + AsyncWrite + Unpin>(
	client: &mut SmtpClient<T>,
	mail: Message<'_>,
	signer: Option<&DkimSigner<RsaKey<Sha256>, mail_auth::dkim::Done>>,
) -> Result<(), mail_send::Error> {
	if let Some(signer) = signer {
		client.send_signed(mail, signer).await
	} else {
		client.send(mail).await
	}
}

struct IdleConnection {
	conn: RelayConnection,
	since: Instant,
}

/// Bounded pool of connections to the upstream relay. Idle connections are
/// reused across sends; the semaphore caps how many exist at once.
pub struct SmtpRelay {
	config: SmtpConfig,
	hostname: String,
	permits: Arc<Semaphore>,
	idle: Mutex<Vec<IdleConnection>>,
}

impl SmtpRelay {
	pub fn new(config: SmtpConfig, hostname: String) -> Self {
		let max_connections = config.max_connections.max(1);
		Self {
			config,
			hostname,
			permits: Arc::new(Semaphore::new(max_connections)),
			idle: Mutex::new(Vec::new()),
		}
	}

	/// Handshake with the relay without sending anything.
	pub async fn verify(&self) -> Result<(), SmtpFailure> {
		let _conn = self.connect().await?;
		Ok(())
	}

	/// Drops every pooled connection. In-flight sends finish on their own
	/// checked-out connections.
	pub async fn close(&self) {
		self.idle.lock().await.clear();
	}

	async fn connect(&self) -> Result<RelayConnection, SmtpFailure> {
		ensure_rustls_crypto_provider();

		let mut builder = SmtpClientBuilder::new(self.config.host.clone(), self.config.port)
			.implicit_tls(false)
			.helo_host(self.hostname.clone())
			.timeout(self.config.timeout);

		if let (Some(user), Some(pass)) = (&self.config.user, &self.config.pass) {
			builder = builder.credentials((user.clone(), pass.clone()));
		}
		if self.config.allow_invalid_certs {
			builder = builder.allow_invalid_certs();
		}

		match self.config.tls {
			TlsMode::Required => builder
				.connect()
				.await
				.map(RelayConnection::Tls)
				.map_err(|e| classify(&e)),
			TlsMode::None => builder
				.connect_plain()
				.await
				.map(RelayConnection::Plain)
				.map_err(|e| classify(&e)),
			TlsMode::Opportunistic => match builder.connect().await {
				Ok(client) => Ok(RelayConnection::Tls(client)),
				Err(tls_err) => {
					debug!("STARTTLS unavailable, falling back to plaintext: {tls_err}");
					builder
						.connect_plain()
						.await
						.map(RelayConnection::Plain)
						.map_err(|e| classify(&e))
				}
			},
		}
	}

	async fn checkout(&self) -> Result<(RelayConnection, bool), SmtpFailure> {
		let mut idle = self.idle.lock().await;
		while let Some(entry) = idle.pop() {
			if entry.since.elapsed() < MAX_IDLE {
				return Ok((entry.conn, true));
			}
		}
		drop(idle);
		Ok((self.connect().await?, false))
	}

	async fn checkin(&self, conn: RelayConnection) {
		self.idle.lock().await.push(IdleConnection {
			conn,
			since: Instant::now(),
		});
	}

	fn sender(&self, request: &SendRequest) -> String {
		if request.from.trim().is_empty() {
			self.config.from_default.clone()
		} else {
			request.from.clone()
		}
	}

	fn build_rfc822(&self, request: &SendRequest) -> Result<Vec<u8>, SmtpFailure> {
		let mut builder = MessageBuilder::new()
			.from(self.sender(request))
			.to(request.to.clone())
			.message_id(request.message_id.clone());

		if let Some(subject) = request.subject.as_ref() {
			builder = builder.subject(subject.clone());
		}
		if let Some(text_body) = request.text_body.as_ref() {
			builder = builder.text_body(text_body.clone());
		}
		if let Some(html_body) = request.html_body.as_ref() {
			builder = builder.html_body(html_body.clone());
		}

		builder
			.write_to_vec()
			.map_err(|e| SmtpFailure::unknown(format!("message build failed: {e}")))
	}
}

#[async_trait]
impl Mailer for SmtpRelay {
	#[instrument(skip_all, fields(to = %request.to, message_id = %request.message_id))]
	async fn send(
		&self,
		request: &SendRequest,
		dkim: Option<&DkimKey>,
	) -> Result<SendOutcome, SmtpFailure> {
		let rfc822 = self.build_rfc822(request)?;

		// A broken signer never blocks the send itself.
		let signer = dkim.and_then(|key| match key.signer() {
			Ok(signer) => Some(signer),
			Err(err) => {
				warn!(domain = %key.domain, "DKIM signer unavailable, sending unsigned: {err}");
				None
			}
		});

		let _permit = self
			.permits
			.clone()
			.acquire_owned()
			.await
			.map_err(|_| SmtpFailure::connection("relay pool closed"))?;

		let from = self.sender(request);
		let (mut conn, reused) = self.checkout().await?;
		let mail = Message::new(from.clone(), vec![request.to.clone()], rfc822.clone());

		match conn.send_message(mail, signer.as_ref()).await {
			Ok(()) => {
				self.checkin(conn).await;
				return Ok(SendOutcome {
					smtp_id: format!("<{}>", request.message_id),
				});
			}
			Err(err) => {
				let failure = classify(&err);
				// A connection that idled in the pool may have been torn
				// down by the relay; that one retry is free.
				if !(reused && failure.kind == super::FailureKind::Connection) {
					return Err(failure);
				}
				debug!("pooled connection was stale, retrying on a fresh one: {failure}");
			}
		}

		let mut conn = self.connect().await?;
		let mail = Message::new(from, vec![request.to.clone()], rfc822);
		match conn.send_message(mail, signer.as_ref()).await {
			Ok(()) => {
				self.checkin(conn).await;
				Ok(SendOutcome {
					smtp_id: format!("<{}>", request.message_id),
				})
			}
			Err(err) => Err(classify(&err)),
		}
	}
}

fn ensure_rustls_crypto_provider() {
	static INIT: OnceLock<()> = OnceLock::new();
	let _ = INIT.get_or_init(|| {
		let _ = rustls::crypto::ring::default_provider().install_default();
	});
}
