//! Process-wide token bucket for provider calls

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::config::RateLimitConfig;

struct Bucket {
    /// May go negative: each caller reserves a token and sleeps off its deficit
    tokens: f64,
    last_refill: Instant,
}

/// Reservation token bucket. Callers are served in arrival order and the
/// lock is never held across an await.
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    slow_wait_threshold: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let burst = f64::from(config.burst.max(1));
        Self {
            rate_per_sec: config.rate_per_sec.max(f64::MIN_POSITIVE),
            burst,
            slow_wait_threshold: config.slow_wait_threshold,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting until it is available
    pub async fn acquire(&self) {
        let wait = self.reserve();
        if wait.is_zero() {
            return;
        }
        if wait > self.slow_wait_threshold {
            warn!("Provider rate limit reached, waiting {:?} for a token", wait);
        }
        tokio::time::sleep(wait).await;
    }

    fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut bucket = match self.bucket.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.rate_per_sec)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            rate_per_sec: rate,
            burst,
            slow_wait_threshold: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_free() {
        let limiter = limiter(1.0, 3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_once_burst_is_spent() {
        let limiter = limiter(2.0, 1);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        // two extra tokens at 2/s
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_each_reserve() {
        let limiter = std::sync::Arc::new(limiter(10.0, 1));
        let start = Instant::now();
        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_is_pending_until_refill() {
        let limiter = limiter(1.0, 1);
        limiter.acquire().await;

        let mut waiting = tokio_test::task::spawn(limiter.acquire());
        tokio_test::assert_pending!(waiting.poll());

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio_test::assert_ready!(waiting.poll());
    }

    #[test]
    fn test_reserve_refills_up_to_burst() {
        let limiter = limiter(1000.0, 2);
        assert_eq!(limiter.reserve(), Duration::ZERO);
        assert_eq!(limiter.reserve(), Duration::ZERO);
    }
}
