//! Token buckets for throttling disk and network I/O.

use std::time::Duration;

use leaky_bucket::RateLimiter;
use tokio_util::sync::CancellationToken;

/// How long a refused consumer sleeps before asking the bucket again.
const REFUSAL_SLEEP: Duration = Duration::from_millis(500);

/// A byte-granularity token bucket. `None` inside means unlimited.
pub struct TokenBucket {
    limiter: Option<RateLimiter>,
    max: usize,
}

impl TokenBucket {
    /// `rate` is the sustained bytes-per-second budget; `burst` is the bucket
    /// capacity. A zero rate constructs an unlimited bucket.
    pub fn new(rate: usize, burst: usize) -> Self {
        if rate == 0 {
            return Self::unlimited();
        }
        let max = std::cmp::max(rate, burst);
        TokenBucket {
            limiter: Some(
                RateLimiter::builder()
                    .max(max)
                    .initial(max)
                    .refill(rate)
                    .interval(Duration::from_secs(1))
                    .build(),
            ),
            max,
        }
    }

    pub fn unlimited() -> Self {
        TokenBucket {
            limiter: None,
            max: usize::MAX,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limiter.is_none()
    }

    /// Take `n` tokens out of the bucket. If the bucket cannot satisfy the
    /// request right now, sleep 500 ms and retry. Returns false if cancelled
    /// while waiting.
    pub async fn consume(&self, n: usize, cancel: &CancellationToken) -> bool {
        let Some(limiter) = &self.limiter else {
            return true;
        };
        // a single request larger than the bucket would never succeed
        let n = std::cmp::min(n, self.max);
        loop {
            if limiter.try_acquire(n) {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(REFUSAL_SLEEP) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let bucket = TokenBucket::unlimited();
        let cancel = CancellationToken::new();
        assert!(bucket.consume(usize::MAX, &cancel).await);
    }

    #[tokio::test]
    async fn consume_within_burst() {
        let bucket = TokenBucket::new(1024, 4096);
        let cancel = CancellationToken::new();
        assert!(bucket.consume(4096, &cancel).await);
    }

    #[tokio::test]
    async fn cancelled_consumer_returns_false() {
        let bucket = TokenBucket::new(1, 1);
        let cancel = CancellationToken::new();
        // drain the bucket
        assert!(bucket.consume(1, &cancel).await);
        cancel.cancel();
        assert!(!bucket.consume(1, &cancel).await);
    }
}
