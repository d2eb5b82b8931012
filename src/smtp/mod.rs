pub mod classify;
pub mod dkim;
pub mod relay;

use async_trait::async_trait;

pub use classify::{FailureKind, SmtpFailure};
pub use dkim::{DkimCache, DkimKey};
pub use relay::SmtpRelay;

#[derive(Debug, Clone)]
pub struct SendRequest {
	/// Message-ID without angle brackets, `{message_id}@{hostname}`.
	pub message_id: String,
	pub from: String,
	pub to: String,
	pub subject: Option<String>,
	pub text_body: Option<String>,
	pub html_body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
	/// The Message-ID the relay accepted the message under.
	pub smtp_id: String,
}

/// The transport seam the email worker sends through. `SmtpRelay` is the
/// production implementation; tests substitute scripted ones.
#[async_trait]
pub trait Mailer: Send + Sync {
	async fn send(
		&self,
		request: &SendRequest,
		dkim: Option<&DkimKey>,
	) -> Result<SendOutcome, SmtpFailure>;
}
