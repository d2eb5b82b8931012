use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 over `{timestamp}.{payload}`. Receivers recompute this
/// with their stored secret over the raw request body.
pub fn signature(secret: &str, timestamp_ms: i64, payload: &str) -> String {
	let mut mac =
		HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
	mac.update(timestamp_ms.to_string().as_bytes());
	mac.update(b".");
	mac.update(payload.as_bytes());
	hex::encode(mac.finalize().into_bytes())
}

/// The wire form carried in `X-Courier-Signature`. The `v1=` prefix leaves
/// room for algorithm rotation.
pub fn header_value(secret: &str, timestamp_ms: i64, payload: &str) -> String {
	format!("v1={}", signature(secret, timestamp_ms, payload))
}

pub fn verify(secret: &str, timestamp_ms: i64, payload: &str, hex_signature: &str) -> bool {
	let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
		Ok(mac) => mac,
		Err(_) => return false,
	};
	mac.update(timestamp_ms.to_string().as_bytes());
	mac.update(b".");
	mac.update(payload.as_bytes());
	let Ok(expected) = hex::decode(hex_signature) else {
		return false;
	};
	mac.verify_slice(&expected).is_ok()
}
