use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use uuid::Uuid;

struct Bucket {
	tokens: f64,
	last_refill: Instant,
}

/// In-process per-tenant token buckets. One token per submission, refilled
/// at the tenant's configured rate; the bucket never holds more than one
/// second's worth of burst.
#[derive(Default)]
pub struct RateLimiter {
	buckets: Mutex<HashMap<Uuid, Bucket>>,
}

impl RateLimiter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn allow(&self, api_key_id: Uuid, per_second: u32) -> bool {
		if per_second == 0 {
			return false;
		}
		let capacity = per_second as f64;
		let now = Instant::now();

		let mut buckets = match self.buckets.lock() {
			Ok(guard) => guard,
			Err(poisoned) => poisoned.into_inner(),
		};
		let bucket = buckets.entry(api_key_id).or_insert(Bucket {
			tokens: capacity,
			last_refill: now,
		});

		let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
		bucket.tokens = (bucket.tokens + elapsed * capacity).min(capacity);
		bucket.last_refill = now;

		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}
