//! Applied index watermark with bounded waits

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::{ControllerResult, Error};

/// Highest applied log index, shared between the state machine and waiters.
///
/// The value only ever moves forward.
#[derive(Debug, Clone)]
pub struct IndexTracker {
    applied: Arc<watch::Sender<Option<u64>>>,
}

impl Default for IndexTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

impl IndexTracker {
    /// Tracker starting at `applied`
    pub fn new(applied: Option<u64>) -> Self {
        let (applied, _) = watch::channel(applied);
        Self {
            applied: Arc::new(applied),
        }
    }

    /// Current watermark; `None` until the first entry is applied
    pub fn current(&self) -> Option<u64> {
        *self.applied.borrow()
    }

    /// Raise the watermark to `index`; lower values are ignored
    pub fn advance(&self, index: u64) {
        self.applied.send_if_modified(|current| match current {
            Some(c) if *c >= index => false,
            _ => {
                *current = Some(index);
                true
            }
        });
    }

    /// Wait until `index` has been applied, for at most `timeout`
    pub async fn wait_for(&self, index: u64, timeout: Duration) -> ControllerResult<()> {
        let mut rx = self.applied.subscribe();
        let reached = rx.wait_for(|applied| applied.is_some_and(|a| a >= index));

        match tokio::time::timeout(timeout, reached).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::timeout(
                format!("waiting for index {index} to be applied"),
                timeout,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let tracker = IndexTracker::default();
        assert_eq!(tracker.current(), None);

        tracker.advance(5);
        tracker.advance(3);
        assert_eq!(tracker.current(), Some(5));

        tracker.advance(0);
        assert_eq!(tracker.current(), Some(5));
    }

    #[tokio::test]
    async fn test_wait_returns_once_reached() {
        let tracker = IndexTracker::new(Some(1));
        tracker.wait_for(1, Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_for(4, Duration::from_secs(5)).await })
        };

        tracker.advance(2);
        tracker.advance(4);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let tracker = IndexTracker::new(Some(1));
        let err = tracker
            .wait_for(2, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
