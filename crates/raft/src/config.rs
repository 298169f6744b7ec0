//! Controller configuration

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use openraft::SnapshotPolicy;
use serde::{Deserialize, Serialize};

use crate::{ControllerResult, Error};

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Member id, unique within the cluster
    pub id: String,

    /// Address other members dial to reach this controller
    pub advertise_address: String,

    /// Address to bind; defaults to the advertise address
    pub listen_address: Option<String>,

    /// Directory holding the log store and the state machine store
    pub data_dir: PathBuf,

    /// Software version, compared against every peer
    pub version: String,

    /// Addresses of members to join once this node leads a cluster
    pub initial_members: Vec<String>,

    /// Bootstrap a new cluster when the log is empty
    pub bootstrap: bool,

    /// Voters required before bootstrap seeds the configuration
    pub min_cluster_size: usize,

    /// Bound on a forwarded request round trip
    pub forward_timeout: Duration,

    /// Bound on dialing a peer
    pub connect_timeout: Duration,

    /// Bound on waiting for the local log to reach a forwarded write
    pub index_wait_timeout: Duration,

    /// Bound on observing leadership during bootstrap
    pub bootstrap_timeout: Duration,

    /// Pause between attempts to join a configured member
    pub join_retry_interval: Duration,

    /// Warn when the cluster has had no leader for this long
    pub warn_when_leaderless_for: Duration,

    /// Ask the process to restart after a snapshot replaced existing state
    pub restart_on_restore: bool,

    /// Consensus settings
    pub raft: RaftSettings,

    /// Apply concurrency ceiling
    pub rate_limiter: RateLimiterConfig,

    /// Inbound forwarded command queue
    pub command_handler: CommandHandlerConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            id: "ctrl".to_string(),
            advertise_address: "127.0.0.1:6262".to_string(),
            listen_address: None,
            data_dir: PathBuf::from("data"),
            version: env!("CARGO_PKG_VERSION").to_string(),
            initial_members: Vec::new(),
            bootstrap: true,
            min_cluster_size: 1,
            forward_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            index_wait_timeout: Duration::from_secs(5),
            bootstrap_timeout: Duration::from_secs(30),
            join_retry_interval: Duration::from_secs(5),
            warn_when_leaderless_for: Duration::from_secs(60),
            restart_on_restore: true,
            raft: RaftSettings::default(),
            rate_limiter: RateLimiterConfig::default(),
            command_handler: CommandHandlerConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Configuration for member `id` at `advertise_address` storing state
    /// under `data_dir`
    pub fn new(
        id: impl Into<String>,
        advertise_address: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            advertise_address: advertise_address.into(),
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> ControllerResult<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("id must not be empty".to_string()));
        }
        if self.advertise_address.trim().is_empty() {
            return Err(Error::Config(
                "advertise_address must not be empty".to_string(),
            ));
        }
        if self.min_cluster_size == 0 {
            return Err(Error::Config("min_cluster_size must be at least 1".to_string()));
        }
        if self.rate_limiter.enabled && self.rate_limiter.max_in_flight == 0 {
            return Err(Error::Config(
                "rate_limiter.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.command_handler.max_queue_size == 0 {
            return Err(Error::Config(
                "command_handler.max_queue_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn log_store_path(&self) -> PathBuf {
        self.data_dir.join("raft-log")
    }

    pub(crate) fn state_machine_path(&self) -> PathBuf {
        self.data_dir.join("ctrl.db")
    }
}

/// Consensus timing and snapshot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftSettings {
    /// Leader heartbeat interval
    pub heartbeat_interval: Duration,

    /// Election timeout minimum
    pub election_timeout_min: Duration,

    /// Election timeout maximum
    pub election_timeout_max: Duration,

    /// Bound on a replicated apply, from submission to commit
    pub commit_timeout: Duration,

    /// Build a snapshot after this many entries since the last one
    pub snapshot_threshold: u64,

    /// Also build a snapshot on this interval; zero disables it
    pub snapshot_interval: Duration,

    /// Entries kept in the log after a snapshot
    pub trailing_logs: u64,

    /// Max entries per append request
    pub max_payload_entries: u64,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(250),
            election_timeout_min: Duration::from_millis(750),
            election_timeout_max: Duration::from_millis(1500),
            commit_timeout: Duration::from_secs(10),
            snapshot_threshold: 8192,
            snapshot_interval: Duration::from_secs(120),
            trailing_logs: 10_240,
            max_payload_entries: 300,
        }
    }
}

impl RaftSettings {
    /// Build and validate the openraft configuration
    pub fn to_openraft(&self, cluster_name: &str) -> ControllerResult<Arc<openraft::Config>> {
        let config = openraft::Config {
            cluster_name: cluster_name.to_string(),
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: self.trailing_logs,
            max_payload_entries: self.max_payload_entries,
            ..Default::default()
        };

        let config = config
            .validate()
            .map_err(|e| Error::Config(format!("invalid raft settings: {e}")))?;
        Ok(Arc::new(config))
    }
}

/// Bounds concurrent applies on the leader
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Whether the limiter is active
    pub enabled: bool,

    /// Maximum applies in flight
    pub max_in_flight: usize,

    /// How long a caller may wait for a slot before being rejected; zero
    /// rejects immediately
    pub queue_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_in_flight: 100,
            queue_timeout: Duration::ZERO,
        }
    }
}

/// Queue feeding the single worker that applies forwarded commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandHandlerConfig {
    /// Queued forwarded commands before new ones are rejected
    pub max_queue_size: usize,
}

impl Default for CommandHandlerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ControllerConfig::default();
        config.validate().unwrap();
        config.raft.to_openraft("fabric").unwrap();
    }

    #[test]
    fn test_invalid_config() {
        let mut config = ControllerConfig::new("", "a:1", "/tmp/x");
        assert!(config.validate().is_err());

        config.id = "a".to_string();
        config.min_cluster_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_election_timeouts_rejected() {
        let settings = RaftSettings {
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(100),
            ..RaftSettings::default()
        };
        assert!(settings.to_openraft("fabric").is_err());
    }

    #[test]
    fn test_serialization() {
        let config = ControllerConfig::new("ctrl-a", "ctrl-a:6262", "/var/lib/fabric");
        let json = serde_json::to_string(&config).unwrap();
        let back: ControllerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "ctrl-a");
        assert_eq!(back.raft.commit_timeout, config.raft.commit_timeout);

        // missing sections fall back to defaults
        let partial: ControllerConfig = serde_json::from_str(r#"{"id":"ctrl-b"}"#).unwrap();
        assert_eq!(partial.id, "ctrl-b");
        assert_eq!(partial.command_handler.max_queue_size, 1000);
    }
}
