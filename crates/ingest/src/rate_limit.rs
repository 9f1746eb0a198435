//! Per-`client_id` token-bucket rate limiting for the ingest boundary.

use std::{collections::HashMap, sync::Mutex};

/// A token bucket rate limiter keyed by client id.
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill_ms: i64,
}

impl RateLimiter {
    /// Creates a limiter with the given sustained rate (tokens/sec) and
    /// burst capacity (max tokens a bucket can hold).
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst: burst as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts to consume one token for `client_id` at `now_ms`. Returns
    /// `true` if the request is allowed.
    pub fn check(&self, client_id: &str, now_ms: i64) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let bucket = buckets.entry(client_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.burst,
            last_refill_ms: now_ms,
        });

        let elapsed_secs = ((now_ms - bucket.last_refill_ms).max(0) as f64) / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed_secs * self.rate_per_sec).min(self.burst);
        bucket.last_refill_ms = now_ms;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
