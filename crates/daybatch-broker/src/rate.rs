//! Token-bucket rate limiting for broker traffic.
//!
//! Two process-wide buckets: order-class (submits and cancels) and
//! info-class (polling). Acquisition blocks until a token is available,
//! so callers simply `await` before every broker call.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// One token bucket refilled continuously at `per_sec`.
struct TokenBucket {
    capacity: f64,
    per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(per_sec: u32) -> Self {
        let capacity = f64::from(per_sec.max(1));
        Self {
            capacity,
            per_sec: capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.per_sec).min(self.capacity);
        state.refilled_at = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token can be taken.
    async fn acquire(&self) {
        let mut waited = Duration::ZERO;
        loop {
            if self.try_acquire() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
            waited += Duration::from_millis(25);
            if waited == Duration::from_secs(5) {
                warn!(waited_ms = waited.as_millis() as u64, "Still waiting for a rate token");
            }
        }
    }
}

/// Process-wide rate limiter over the two broker traffic classes.
pub struct RateLimiter {
    order: TokenBucket,
    info: TokenBucket,
}

impl RateLimiter {
    /// Create with tokens-per-second budgets for each class.
    pub fn new(order_per_sec: u32, info_per_sec: u32) -> Self {
        Self {
            order: TokenBucket::new(order_per_sec),
            info: TokenBucket::new(info_per_sec),
        }
    }

    /// Block until an order-class token (submit / cancel) is available.
    pub async fn acquire_order(&self) {
        self.order.acquire().await;
    }

    /// Block until an info-class token (poll) is available.
    pub async fn acquire_info(&self) {
        self.info.acquire().await;
    }

    /// Non-blocking order-class acquire, for callers that prefer to skip
    /// a tick over queueing.
    pub fn try_acquire_order(&self) -> bool {
        self.order.try_acquire()
    }

    /// Non-blocking info-class acquire.
    pub fn try_acquire_info(&self) -> bool {
        self.info.try_acquire()
    }
}
