//! Token-bucket guard for CLOB API calls
//!
//! The tick loop already paces order checks with an explicit sleep; this
//! bucket is the backstop that keeps a burst (mass expiry cancelling many
//! orders in one tick) inside the exchange's published per-IP limits.
//! Budgets sit well under the real limits since this process is the only
//! caller.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Rate limit endpoint classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// Reads: order status, order book, price
    General,
    /// POST /order
    PostOrder,
    /// DELETE /order
    CancelOrder,
}

impl EndpointClass {
    /// Requests allowed per window
    fn max_tokens(&self) -> u32 {
        match self {
            EndpointClass::General => 200,
            EndpointClass::PostOrder => 40,
            EndpointClass::CancelOrder => 40,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(10)
    }
}

/// A single token bucket
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    fn new(class: EndpointClass) -> Self {
        let max = class.max_tokens() as f64;
        let window_secs = class.window().as_secs_f64();
        Self {
            tokens: max,
            max_tokens: max,
            refill_rate: max / window_secs,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            let deficit = 1.0 - self.tokens;
            Duration::from_secs_f64(deficit / self.refill_rate)
        }
    }
}

/// Rate limiter with one bucket per endpoint class
pub struct RateLimiter {
    general: Arc<Mutex<TokenBucket>>,
    post_order: Arc<Mutex<TokenBucket>>,
    cancel_order: Arc<Mutex<TokenBucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            general: Arc::new(Mutex::new(TokenBucket::new(EndpointClass::General))),
            post_order: Arc::new(Mutex::new(TokenBucket::new(EndpointClass::PostOrder))),
            cancel_order: Arc::new(Mutex::new(TokenBucket::new(EndpointClass::CancelOrder))),
        }
    }

    /// Acquire a token for the given endpoint class, sleeping until one is
    /// available. Returns true if we had to wait.
    pub async fn acquire(&self, class: EndpointClass) -> bool {
        let bucket = self.get_bucket(class);
        let mut waited = false;
        loop {
            let wait_time = {
                let mut b = bucket.lock().await;
                if b.try_acquire() {
                    return waited;
                }
                b.time_until_available()
            };

            waited = true;
            debug!("Rate limiter: waiting {:?} for {:?}", wait_time, class);
            tokio::time::sleep(wait_time).await;
        }
    }

    fn get_bucket(&self, class: EndpointClass) -> &Arc<Mutex<TokenBucket>> {
        match class {
            EndpointClass::General => &self.general,
            EndpointClass::PostOrder => &self.post_order,
            EndpointClass::CancelOrder => &self.cancel_order,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_buckets_do_not_wait() {
        let limiter = RateLimiter::new();
        assert!(!limiter.acquire(EndpointClass::General).await);
        assert!(!limiter.acquire(EndpointClass::PostOrder).await);
        assert!(!limiter.acquire(EndpointClass::CancelOrder).await);
    }

    #[tokio::test]
    async fn test_drained_bucket_waits() {
        let limiter = RateLimiter::new();
        for _ in 0..EndpointClass::PostOrder.max_tokens() {
            limiter.acquire(EndpointClass::PostOrder).await;
        }
        // Bucket is empty now; the next acquire has to wait for refill
        assert!(limiter.acquire(EndpointClass::PostOrder).await);
    }
}
