//! Turns raft metrics and mesh notifications into cluster events

use std::time::Duration;

use fabric_mesh::MeshEvent;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use super::Controller;
use crate::events::{ClusterEvent, EventHub};

const OBSERVER_TICK: Duration = Duration::from_secs(1);

/// Last observed cluster state, so only transitions are emitted
#[derive(Debug)]
struct ObservedState {
    is_leader: bool,
    leader: Option<String>,
    read_only: bool,
    leaderless_since: Option<Instant>,
    warn_after: Duration,
}

impl ObservedState {
    fn new(warn_after: Duration) -> Self {
        Self {
            is_leader: false,
            leader: None,
            read_only: false,
            leaderless_since: Some(Instant::now()),
            warn_after,
        }
    }

    fn observe_leader(&mut self, is_leader: bool, leader: Option<String>, events: &EventHub) {
        if is_leader != self.is_leader {
            self.is_leader = is_leader;
            if is_leader {
                info!("gained leadership");
                events.emit(ClusterEvent::LeadershipGained);
            } else {
                info!("lost leadership");
                events.emit(ClusterEvent::LeadershipLost);
            }
        }

        if leader == self.leader {
            return;
        }
        match &leader {
            Some(id) => {
                self.leaderless_since = None;
                events.emit(ClusterEvent::HasLeader { leader: id.clone() });
            }
            None => {
                self.leaderless_since = Some(Instant::now());
                events.emit(ClusterEvent::Leaderless);
            }
        }
        self.leader = leader;
    }

    fn observe_read_only(&mut self, read_only: bool, events: &EventHub) {
        if read_only == self.read_only {
            return;
        }
        self.read_only = read_only;
        if read_only {
            warn!("cluster is read-only, members run incompatible versions");
            events.emit(ClusterEvent::ReadOnly);
        } else {
            info!("cluster is read-write");
            events.emit(ClusterEvent::ReadWrite);
        }
    }

    /// Warn at most once per period while leaderless
    fn check_leaderless(&mut self, now: Instant) {
        let Some(since) = self.leaderless_since else {
            return;
        };
        let elapsed = now.saturating_duration_since(since);
        if !self.warn_after.is_zero() && elapsed >= self.warn_after {
            warn!("no leader for {:?}", elapsed);
            self.leaderless_since = Some(now);
        }
    }
}

impl Controller {
    pub(super) fn spawn_observer(&self) {
        let raft = self.inner.raft.clone();
        let mesh = self.inner.mesh.clone();
        let events = self.inner.events.clone();
        let cancel = self.inner.cancel.clone();
        let mut state = ObservedState::new(self.inner.config.warn_when_leaderless_for);

        let mut metrics = raft.metrics();
        let mut read_only = mesh.subscribe_read_only();
        let mut mesh_events = mesh.subscribe_events();

        self.inner.tasks.spawn(async move {
            let mut tick = tokio::time::interval(OBSERVER_TICK);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            state.observe_read_only(*read_only.borrow(), &events);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = metrics.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let (is_leader, leader) = {
                            let m = metrics.borrow_and_update();
                            (m.state.is_leader(), m.current_leader.clone())
                        };
                        state.observe_leader(is_leader, leader, &events);
                    }
                    changed = read_only.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let value = *read_only.borrow_and_update();
                        state.observe_read_only(value, &events);
                    }
                    event = mesh_events.recv() => match event {
                        Ok(MeshEvent::PeerConnected { id, address, version }) => {
                            events.emit(ClusterEvent::PeerConnected { id, address, version });
                        }
                        Ok(MeshEvent::PeerDisconnected { id, address }) => {
                            events.emit(ClusterEvent::PeerDisconnected { id, address });
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("observer fell behind, {} mesh events dropped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    now = tick.tick() => state.check_leaderless(now),
                }
            }
        });
    }

    /// Periodically ask raft for a snapshot when entries were applied since
    /// the last one
    pub(super) fn spawn_snapshot_timer(&self) {
        let period = self.inner.config.raft.snapshot_interval;
        if period.is_zero() {
            return;
        }

        let raft = self.inner.raft.clone();
        let fsm = self.inner.fsm.clone();
        let cancel = self.inner.cancel.clone();

        self.inner.tasks.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            let mut last = fsm.applied_index();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let applied = fsm.applied_index();
                if applied == last {
                    continue;
                }
                if let Err(e) = raft.trigger().snapshot().await {
                    warn!("failed to trigger snapshot: {}", e);
                    continue;
                }
                last = applied;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_transitions_are_emitted() {
        let events = EventHub::new();
        let mut rx = events.subscribe();
        let mut state = ObservedState::new(Duration::from_secs(60));

        state.observe_leader(false, None, &events);
        state.observe_leader(true, Some("ctrl-a".to_string()), &events);
        state.observe_leader(true, Some("ctrl-a".to_string()), &events);
        state.observe_leader(false, None, &events);
        state.observe_read_only(false, &events);
        state.observe_read_only(true, &events);

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                ClusterEvent::LeadershipGained,
                ClusterEvent::HasLeader {
                    leader: "ctrl-a".to_string()
                },
                ClusterEvent::LeadershipLost,
                ClusterEvent::Leaderless,
                ClusterEvent::ReadOnly,
            ]
        );
    }

    #[tokio::test]
    async fn test_leaderless_warning_period_restarts() {
        let mut state = ObservedState::new(Duration::from_millis(10));
        let start = state.leaderless_since.unwrap();

        state.check_leaderless(start + Duration::from_millis(5));
        assert_eq!(state.leaderless_since, Some(start));

        let later = start + Duration::from_millis(20);
        state.check_leaderless(later);
        assert_eq!(state.leaderless_since, Some(later));
    }
}
