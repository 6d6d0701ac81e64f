//! Token bucket rate limiting for external calls.
//!
//! One limiter is shared by all workers of a stage. The bucket starts full
//! with `max_calls` tokens and refills continuously at
//! `max_calls / time_window` tokens per second, so no window of
//! `time_window` seconds ever admits more than `max_calls` acquisitions
//! beyond the initial burst.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Upper bound on a single wait between availability checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    max_calls: u32,
    time_window: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `max_calls` is clamped to at least one token.
    pub fn new(max_calls: u32, time_window: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            time_window,
            bucket: Mutex::new(Bucket {
                tokens: max_calls as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    pub fn time_window(&self) -> Duration {
        self.time_window
    }

    fn refill_rate(&self) -> f64 {
        let secs = self.time_window.as_secs_f64();
        if secs <= 0.0 {
            f64::INFINITY
        } else {
            self.max_calls as f64 / secs
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let new_tokens = elapsed * self.refill_rate();
        if new_tokens > 0.0 {
            bucket.tokens = (bucket.tokens + new_tokens).min(self.max_calls as f64);
            bucket.last_refill = now;
        }
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it.
    ///
    /// Returns how long the caller waited. Cancel-safe: the lock is never
    /// held across an await.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return started.elapsed();
                }
                let needed = 1.0 - bucket.tokens;
                Duration::from_secs_f64(needed / self.refill_rate())
            };
            tokio::time::sleep(wait.clamp(Duration::from_millis(1), POLL_INTERVAL)).await;
        }
    }

    /// Tokens currently in the bucket, after refilling.
    pub async fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }
}
