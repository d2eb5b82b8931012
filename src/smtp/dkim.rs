use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::{Engine, engine::general_purpose::STANDARD};
use mail_auth::{
	common::crypto::{RsaKey, Sha256},
	dkim::DkimSigner,
};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::model::{Domain, address_domain};
use crate::store::MailStore;

/// Header set covered by the signature. Mutating any of these after signing
/// breaks verification downstream.
pub const SIGNED_HEADERS: [&str; 7] = [
	"From",
	"To",
	"Subject",
	"Date",
	"Message-ID",
	"MIME-Version",
	"Content-Type",
];

#[derive(Debug, Clone)]
pub struct DkimKey {
	pub domain: String,
	pub selector: String,
	pub private_key_b64: String,
}

impl DkimKey {
	/// Key material is only usable once the domain passed verification and
	/// carries both a selector and a private key.
	pub fn from_domain(row: &Domain) -> Option<Self> {
		if !row.verified {
			return None;
		}
		let selector = row.dkim_selector.clone().filter(|v| !v.is_empty())?;
		let private_key_b64 = row.dkim_private_key.clone().filter(|v| !v.is_empty())?;
		Some(Self {
			domain: row.domain.clone(),
			selector,
			private_key_b64,
		})
	}

	pub fn signer(&self) -> Result<DkimSigner<RsaKey<Sha256>, mail_auth::dkim::Done>, SignerError> {
		let private_key = STANDARD
			.decode(self.private_key_b64.trim())
			.map_err(|e| SignerError::Base64(e.to_string()))?;

		let key = RsaKey::<Sha256>::from_pkcs8_der(&private_key)
			.or_else(|_| RsaKey::<Sha256>::from_der(&private_key))
			.map_err(|e| {
				SignerError::Key(format!(
					"invalid private key (expected PKCS8 or PKCS1 DER): {e}"
				))
			})?;

		Ok(DkimSigner::from_key(key)
			.domain(self.domain.clone())
			.selector(self.selector.clone())
			.headers(SIGNED_HEADERS))
	}
}

#[derive(Debug, Error)]
pub enum SignerError {
	#[error("invalid base64 key: {0}")]
	Base64(String),

	#[error("{0}")]
	Key(String),
}

struct CacheEntry {
	expires_at: Instant,
	key: Option<DkimKey>,
}

/// Short-lived cache in front of the per-domain key lookup. Entries expire
/// by TTL; negative results are cached too so an unsigned tenant does not
/// hit the store on every message.
pub struct DkimCache {
	ttl: Duration,
	entries: Mutex<HashMap<(Uuid, String), CacheEntry>>,
}

impl DkimCache {
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl: ttl.min(Duration::from_secs(300)),
			entries: Mutex::new(HashMap::new()),
		}
	}

	/// Resolves the signing key for a sender address, or `None` for an
	/// unsigned send. Lookup errors degrade to unsigned: signing is a
	/// reputation concern, not a correctness one.
	pub async fn resolve(
		&self,
		store: &dyn MailStore,
		api_key_id: Uuid,
		sender: &str,
	) -> Option<DkimKey> {
		let domain = address_domain(sender)?.to_ascii_lowercase();
		let cache_key = (api_key_id, domain.clone());

		{
			let entries = match self.entries.lock() {
				Ok(guard) => guard,
				Err(poisoned) => poisoned.into_inner(),
			};
			if let Some(entry) = entries.get(&cache_key)
				&& entry.expires_at > Instant::now()
			{
				return entry.key.clone();
			}
		}

		let key = match store.sending_domain(api_key_id, &domain).await {
			Ok(row) => row.as_ref().and_then(DkimKey::from_domain),
			Err(err) => {
				warn!(%api_key_id, %domain, "DKIM domain lookup failed, sending unsigned: {err}");
				return None;
			}
		};

		let mut entries = match self.entries.lock() {
			Ok(guard) => guard,
			Err(poisoned) => poisoned.into_inner(),
		};
		entries.insert(
			cache_key,
			CacheEntry {
				expires_at: Instant::now() + self.ttl,
				key: key.clone(),
			},
		);
		key
	}
}
