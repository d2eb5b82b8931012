use std::time::Duration;

use rand::Rng;

const MAX_SHIFT: u32 = 20;
const JITTER: f64 = 0.3;

/// `base × 2^(attempts−1) × (1 + U[0, 0.3])`, saturating. The first retry
/// (attempts = 1) waits roughly one base delay.
pub fn message_retry_delay(base: Duration, attempts: u32) -> Duration {
	let growth = 1u32
		.checked_shl(attempts.saturating_sub(1).min(MAX_SHIFT))
		.unwrap_or(u32::MAX);
	jittered(base.saturating_mul(growth))
}

/// `1 s × 2^prior_attempts × (1 + U[0, 0.3])`: roughly 1, 2, 4, 8, 16
/// seconds across a delivery's first five attempts.
pub fn webhook_retry_delay(prior_attempts: u32) -> Duration {
	let growth = 1u32
		.checked_shl(prior_attempts.min(MAX_SHIFT))
		.unwrap_or(u32::MAX);
	jittered(Duration::from_secs(1).saturating_mul(growth))
}

fn jittered(delay: Duration) -> Duration {
	let factor = 1.0 + rand::thread_rng().gen_range(0.0..=JITTER);
	Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
