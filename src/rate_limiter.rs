use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 1;

/// Leaky bucket handing out one slot per `interval`. Callers that arrive early wait for
/// their slot, so bursts are smoothed out rather than rejected.
#[derive(Debug)]
pub struct Limiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl Limiter {
    pub fn new(interval: Duration) -> Self {
        Limiter {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn per_second(requests: u32) -> Self {
        Limiter::new(Duration::from_secs(1) / requests.max(1))
    }

    /// Waits until the caller may issue its next request.
    pub async fn take(&self) {
        let slot = {
            let mut next_slot = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = (*next_slot).max(Instant::now());
            *next_slot = slot + self.interval;
            slot
        };
        sleep_until(slot).await;
    }
}

/// One shared [`Limiter`] per registry host, created on first use and kept for as long as
/// the registry lives. Every worker polling the same host draws from the same bucket.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    requests_per_second: u32,
    limiters: Mutex<HashMap<String, Arc<Limiter>>>,
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        RateLimiterRegistry::new(DEFAULT_REQUESTS_PER_SECOND)
    }
}

impl RateLimiterRegistry {
    pub fn new(requests_per_second: u32) -> Self {
        RateLimiterRegistry {
            requests_per_second,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn limiter_for(&self, registry: &str) -> Arc<Limiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        limiters
            .entry(registry.to_string())
            .or_insert_with(|| {
                debug!(
                    "Creating rate limiter for registry {} at {} request(s) per second",
                    registry, self.requests_per_second
                );
                Arc::new(Limiter::per_second(self.requests_per_second))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_host_shares_limiter() {
        let registry = RateLimiterRegistry::default();
        let a = registry.limiter_for("ghcr.io");
        let b = registry.limiter_for("ghcr.io");
        let c = registry.limiter_for("quay.io");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_per_second_rate() {
        assert_eq!(Limiter::per_second(4).interval, Duration::from_millis(250));
        // zero would divide by zero, treat it as the minimum rate
        assert_eq!(Limiter::per_second(0).interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_take_spaces_out_requests() {
        let limiter = Limiter::new(Duration::from_millis(50));
        let started = Instant::now();
        limiter.take().await;
        limiter.take().await;
        limiter.take().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_first_take_is_immediate() {
        let limiter = Limiter::new(Duration::from_secs(60));
        let started = Instant::now();
        limiter.take().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
