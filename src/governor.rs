//! Token-bucket rate governor shared by the delivery workers.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Token bucket: `capacity` tokens, refilled at `refill_per_sec`.
///
/// `acquire` holds the (FIFO-fair) lock while it waits for the next token,
/// so waiters are served in arrival order.
pub struct RateGovernor {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateGovernor {
    /// The bucket starts full.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("rate capacity must be at least 1".into()));
        }
        if !(refill_per_sec.is_finite() && refill_per_sec > 0.0) {
            return Err(Error::Config(format!(
                "rate refill must be a positive number, got {refill_per_sec}"
            )));
        }
        Ok(Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        })
    }

    /// Wait until a token is available, then take it.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);

        if bucket.tokens < 1.0 {
            let deficit = 1.0 - bucket.tokens;
            let wait = Duration::try_from_secs_f64(deficit / self.refill_per_sec)
                .unwrap_or(Duration::MAX);
            tokio::time::sleep(wait).await;
            self.refill(&mut bucket);
            // Float rounding can leave us a hair short of a whole token.
            bucket.tokens = bucket.tokens.max(1.0);
        }

        bucket.tokens -= 1.0;
    }

    /// Take a token only if one is available right now.
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

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn second_acquire_waits_for_refill() {
        let governor = RateGovernor::new(1, 1.0).unwrap();
        let start = Instant::now();

        governor.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        governor.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_is_immediate() {
        let governor = RateGovernor::new(3, 0.5).unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            governor.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(!governor.try_acquire().await);

        governor.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_in_arrival_order() {
        let governor = Arc::new(RateGovernor::new(1, 10.0).unwrap());
        governor.acquire().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let governor = Arc::clone(&governor);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                governor.acquire().await;
                order.lock().await.push(i);
            }));
            // Let each task reach the lock before spawning the next.
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn tiny_refill_rate_waits_instead_of_panicking() {
        let governor = RateGovernor::new(1, 1e-25).unwrap();
        governor.acquire().await;

        let waited = tokio::time::timeout(Duration::from_secs(3600), governor.acquire()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn rejects_degenerate_settings() {
        assert!(RateGovernor::new(0, 1.0).is_err());
        assert!(RateGovernor::new(1, 0.0).is_err());
        assert!(RateGovernor::new(1, f64::NAN).is_err());
    }
}
