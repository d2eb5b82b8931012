use serde::Serialize;
use thiserror::Error;

/// Reply codes that indicate the mailbox itself cannot receive mail.
/// Failures carrying one of these suppress the recipient.
pub const HARD_BOUNCE_CODES: [u16; 5] = [550, 551, 552, 553, 554];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
	Permanent,
	Temporary,
	Connection,
	Unknown,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SmtpFailure {
	pub kind: FailureKind,
	pub code: Option<u16>,
	pub message: String,
}

impl SmtpFailure {
	pub fn unknown(message: impl Into<String>) -> Self {
		Self {
			kind: FailureKind::Unknown,
			code: None,
			message: message.into(),
		}
	}

	pub fn connection(message: impl Into<String>) -> Self {
		Self {
			kind: FailureKind::Connection,
			code: None,
			message: message.into(),
		}
	}

	pub fn should_retry(&self) -> bool {
		matches!(self.kind, FailureKind::Temporary | FailureKind::Connection)
	}

	pub fn is_hard_bounce(&self) -> bool {
		self.kind == FailureKind::Permanent
			&& self.code.is_some_and(|code| HARD_BOUNCE_CODES.contains(&code))
	}
}

/// Maps a transport error onto the four failure kinds. Pure in the reply
/// code: the same error always classifies the same way.
pub fn classify(err: &mail_send::Error) -> SmtpFailure {
	match err {
		mail_send::Error::UnexpectedReply(reply) => from_code(reply.code(), err.to_string()),
		mail_send::Error::AuthenticationFailed(reply) => from_code(reply.code(), err.to_string()),
		mail_send::Error::Io(_) | mail_send::Error::Timeout | mail_send::Error::Tls(_) => {
			SmtpFailure::connection(err.to_string())
		}
		other => SmtpFailure::unknown(other.to_string()),
	}
}

pub fn from_code(code: u16, message: String) -> SmtpFailure {
	let kind = match code {
		400..=499 => FailureKind::Temporary,
		500..=599 => FailureKind::Permanent,
		_ => FailureKind::Unknown,
	};
	SmtpFailure {
		kind,
		code: Some(code),
		message,
	}
}
