use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::{RateLimitConfig, RetryConfig};

/// Jittered exponential backoff schedule for upstream requests.
///
/// Rate-limit responses carrying an explicit delay bypass this schedule but
/// still count against the attempt budget.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let base = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base),
            max_delay: Duration::from_millis(max_delay_ms.max(base)),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (0-based), exponential and capped,
    /// with +/- `jitter_pct` random spread.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = 2_u32.saturating_pow(attempt);
        let mut delay = self.base_delay.saturating_mul(exp);
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        if self.jitter_pct > 0.0 {
            let spread = (delay.as_millis() as f64 * self.jitter_pct) as i64;
            if spread > 0 {
                let delta = rand::thread_rng().gen_range(-spread..=spread);
                let millis = (delay.as_millis() as i64).saturating_add(delta).max(0);
                delay = Duration::from_millis(millis as u64);
            }
        }
        delay
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self::new(cfg.max_attempts, cfg.base_delay_ms, cfg.max_delay_ms, cfg.jitter_pct)
    }
}

/// Token-bucket limiter shared by every meter's fetches in a run.
///
/// The bucket is the only cross-meter shared state; it is synchronized
/// internally and injected explicitly rather than living in a global.
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    bucket: tokio::sync::Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec: requests_per_second.max(0.001),
            burst,
            bucket: tokio::sync::Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(cfg.requests_per_second, cfg.burst)
    }

    /// Takes one token, sleeping until the bucket refills if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
                bucket.last_refill = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate_per_sec)
            };
            metrics::counter!("api_rate_limit_waits_total").increment(1);
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100, 500, 0.0);
        let delays: Vec<_> = (0..5).map(|attempt| policy.next_delay(attempt)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        assert_eq!(delays[3], Duration::from_millis(500));
        assert_eq!(delays[4], Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = RetryPolicy::new(3, 1000, 10_000, 0.25);
        for attempt in 0..3 {
            let base = 1000u64 << attempt;
            let delay = policy.next_delay(attempt).as_millis() as u64;
            assert!(delay >= base - base / 4 && delay <= base + base / 4);
        }
    }

    #[test]
    fn parameters_are_clamped() {
        let policy = RetryPolicy::new(0, 0, 0, 7.0);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.next_delay(0), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn limiter_serves_burst_without_waiting() {
        let limiter = RateLimiter::new(1.0, 3);
        let started = std::time::Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn limiter_delays_once_bucket_is_drained() {
        let limiter = RateLimiter::new(50.0, 1);
        limiter.acquire().await;
        let started = std::time::Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
