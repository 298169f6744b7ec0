//! Ceiling on concurrent applies

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::RateLimiterConfig;
use crate::{ControllerResult, Error};

/// Rejects applies once `max_in_flight` are already running
#[derive(Debug)]
pub struct RateLimiter {
    permits: Option<Arc<Semaphore>>,
    max_in_flight: usize,
    queue_timeout: Duration,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

/// Slot held for the duration of one apply
#[derive(Debug)]
pub struct RateLimitPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    /// Create a limiter from `config`
    pub fn new(config: &RateLimiterConfig) -> Self {
        let permits = config
            .enabled
            .then(|| Arc::new(Semaphore::new(config.max_in_flight)));

        Self {
            permits,
            max_in_flight: config.max_in_flight,
            queue_timeout: config.queue_timeout,
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Take a slot, waiting at most the configured queue timeout
    pub async fn acquire(&self) -> ControllerResult<RateLimitPermit> {
        let Some(permits) = &self.permits else {
            self.admitted.fetch_add(1, Ordering::Relaxed);
            return Ok(RateLimitPermit { _permit: None });
        };

        let permit = match permits.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) if self.queue_timeout.is_zero() => None,
            Err(_) => tokio::time::timeout(self.queue_timeout, permits.clone().acquire_owned())
                .await
                .ok()
                .and_then(Result::ok),
        };

        match permit {
            Some(permit) => {
                self.admitted.fetch_add(1, Ordering::Relaxed);
                Ok(RateLimitPermit {
                    _permit: Some(permit),
                })
            }
            None => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "rejecting apply, {} already in flight",
                    self.max_in_flight
                );
                Err(Error::TooManyUpdates)
            }
        }
    }

    /// Applies currently holding a slot
    pub fn in_flight(&self) -> usize {
        match &self.permits {
            Some(permits) => self.max_in_flight - permits.available_permits(),
            None => 0,
        }
    }

    /// Applies admitted so far
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// Applies rejected so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_in_flight: usize, queue_timeout: Duration) -> RateLimiter {
        RateLimiter::new(&RateLimiterConfig {
            enabled: true,
            max_in_flight,
            queue_timeout,
        })
    }

    #[tokio::test]
    async fn test_ceiling_rejects_instead_of_queueing() {
        let limiter = limiter(3, Duration::ZERO);

        let held: Vec<_> = futures::future::join_all((0..3).map(|_| limiter.acquire()))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(limiter.in_flight(), 3);

        assert!(matches!(limiter.acquire().await, Err(Error::TooManyUpdates)));
        assert_eq!(limiter.rejected(), 1);

        drop(held);
        assert_eq!(limiter.in_flight(), 0);
        limiter.acquire().await.unwrap();
        assert_eq!(limiter.admitted(), 4);
    }

    #[tokio::test]
    async fn test_bounded_wait_for_slot() {
        let limiter = Arc::new(limiter(1, Duration::from_secs(5)));
        let held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        waiter.await.unwrap().unwrap();
        assert_eq!(limiter.rejected(), 0);
    }

    #[tokio::test]
    async fn test_wait_is_bounded() {
        let limiter = limiter(1, Duration::from_millis(20));
        let _held = limiter.acquire().await.unwrap();
        assert!(matches!(limiter.acquire().await, Err(Error::TooManyUpdates)));
    }

    #[tokio::test]
    async fn test_disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(&RateLimiterConfig {
            enabled: false,
            max_in_flight: 1,
            queue_timeout: Duration::ZERO,
        });
        let _a = limiter.acquire().await.unwrap();
        let _b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.in_flight(), 0);
    }
}
