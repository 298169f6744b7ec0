//! Cluster event fan-out

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::types::ServersWithIndex;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observable happened to the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// This member became leader
    LeadershipGained,
    /// This member stopped being leader
    LeadershipLost,
    /// A leader is known after a leaderless period
    HasLeader {
        /// Current leader
        leader: String,
    },
    /// No leader is known
    Leaderless,
    /// All connected members run compatible versions again
    ReadWrite,
    /// A connected member runs an incompatible version; writes are refused
    ReadOnly,
    /// A member connected over the mesh
    PeerConnected {
        /// Member id
        id: String,
        /// Member address
        address: String,
        /// Member version
        version: String,
    },
    /// A member disconnected
    PeerDisconnected {
        /// Member id
        id: String,
        /// Member address
        address: String,
    },
    /// A newer cluster configuration was applied
    MembersChanged {
        /// Index of the configuration entry
        index: u64,
        /// Members as of that entry
        servers: ServersWithIndex,
    },
    /// State was replaced from a snapshot
    StateRestored {
        /// Applied index after the restore
        index: u64,
        /// Id of the installed snapshot
        snapshot_id: String,
    },
    /// State was replaced underneath a running member; the process should
    /// restart to rebuild anything derived from the old state
    RestartRequired {
        /// What happened
        reason: String,
    },
}

/// Receives cluster events in emission order
pub trait ClusterEventHandler: Send + Sync + 'static {
    /// Called once per event
    fn on_event(&self, event: &ClusterEvent);
}

impl<F> ClusterEventHandler for F
where
    F: Fn(&ClusterEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: &ClusterEvent) {
        self(event)
    }
}

/// Broadcasts events to subscribers and registered handlers
#[derive(Debug)]
pub(crate) struct EventHub {
    tx: broadcast::Sender<ClusterEvent>,
    leader: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            tx,
            leader: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn emit(&self, event: ClusterEvent) {
        match event {
            ClusterEvent::LeadershipGained => self.leader.store(true, Ordering::SeqCst),
            ClusterEvent::LeadershipLost => self.leader.store(false, Ordering::SeqCst),
            _ => {}
        }

        debug!("cluster event: {:?}", event);
        // no receivers is fine
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    /// Deliver every future event to `handler` on a dedicated task.
    ///
    /// A handler added while this member leads first sees a
    /// [`ClusterEvent::LeadershipGained`].
    pub(crate) fn add_handler(&self, handler: Arc<dyn ClusterEventHandler>) {
        let mut rx = self.tx.subscribe();
        if self.leader.load(Ordering::SeqCst) {
            handler.on_event(&ClusterEvent::LeadershipGained);
        }

        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };

                match event {
                    Ok(event) => handler.on_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("event handler fell behind, {} events dropped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn recording() -> (Arc<Mutex<Vec<ClusterEvent>>>, Arc<dyn ClusterEventHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<dyn ClusterEventHandler> = {
            let seen = seen.clone();
            Arc::new(move |event: &ClusterEvent| seen.lock().push(event.clone()))
        };
        (seen, handler)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_handlers_see_events_in_order() {
        let hub = EventHub::new();
        let (seen, handler) = recording();
        hub.add_handler(handler);

        hub.emit(ClusterEvent::Leaderless);
        hub.emit(ClusterEvent::HasLeader {
            leader: "ctrl-b".to_string(),
        });
        settle().await;

        assert_eq!(
            *seen.lock(),
            vec![
                ClusterEvent::Leaderless,
                ClusterEvent::HasLeader {
                    leader: "ctrl-b".to_string()
                },
            ]
        );
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_handler_learns_current_leadership() {
        let hub = EventHub::new();
        hub.emit(ClusterEvent::LeadershipGained);

        let (seen, handler) = recording();
        hub.add_handler(handler);
        assert_eq!(*seen.lock(), vec![ClusterEvent::LeadershipGained]);

        hub.emit(ClusterEvent::LeadershipLost);
        settle().await;

        let (late, handler) = recording();
        hub.add_handler(handler);
        assert!(late.lock().is_empty());
        assert_eq!(
            *seen.lock(),
            vec![ClusterEvent::LeadershipGained, ClusterEvent::LeadershipLost]
        );
        hub.shutdown().await;
    }
}
