//! Raft type configuration and replicated metadata

use std::collections::BTreeSet;
use std::io::Cursor;

use fabric_command::ApiErrorPayload;
use fabric_db::MetaKey;
use openraft::{LogId, StoredMembership};
use serde::{Deserialize, Serialize};

openraft::declare_raft_types!(
    /// Types for the controller cluster
    pub TypeConfig:
        D = CommandPayload,
        R = ApplyResult,
        NodeId = String,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

/// Raft handle for the controller cluster
pub type ControllerRaft = openraft::Raft<TypeConfig>;

/// An encoded command as carried in the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    /// Type-prefixed command bytes
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl CommandPayload {
    /// Wrap encoded command bytes
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

/// Outcome of applying one log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyResult {
    /// Index of the entry
    pub index: u64,
    /// Set when the command rejected its input; the index is consumed anyway
    pub error: Option<ApiErrorPayload>,
}

impl ApplyResult {
    pub(crate) fn applied(index: u64) -> Self {
        Self { index, error: None }
    }

    pub(crate) fn rejected(index: u64, error: ApiErrorPayload) -> Self {
        Self {
            index,
            error: Some(error),
        }
    }
}

/// A cluster member as recorded in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Member id
    pub id: String,
    /// Advertised address
    pub address: String,
    /// Whether the member votes
    pub is_voter: bool,
}

/// Cluster configuration as of a log index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServersWithIndex {
    /// Members, sorted by id
    pub servers: Vec<Server>,
    /// Index of the configuration entry
    pub index: u64,
}

impl ServersWithIndex {
    pub(crate) fn from_membership(membership: &StoredMembership<TypeConfig>) -> Self {
        let config = membership.membership();
        let voters: BTreeSet<String> = config.voter_ids().collect();
        let mut servers: Vec<Server> = config
            .nodes()
            .map(|(id, node)| Server {
                id: id.clone(),
                address: node.addr.clone(),
                is_voter: voters.contains(id),
            })
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));

        Self {
            servers,
            index: membership.log_id().as_ref().map_or(0, |id| id.index),
        }
    }

    /// Member with id `id`
    pub fn get(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }
}

/// Live view of a member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member id
    pub id: String,
    /// Advertised address
    pub address: String,
    /// Whether the member votes
    pub is_voter: bool,
    /// Whether the member currently leads
    pub is_leader: bool,
    /// Version reported over the mesh; empty when not connected
    pub version: String,
    /// Whether the member is connected, always true for the local member
    pub is_connected: bool,
}

/// Value of `servers/<id>` in the metadata bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ServerRecord {
    pub address: String,
    pub is_voter: bool,
}

pub(crate) const APPLIED_INDEX_KEY: &str = "raft_applied_index";
pub(crate) const SERVERS_INDEX_KEY: &str = "servers_index";
pub(crate) const SERVERS_PREFIX: &str = "servers/";

/// Log id of the last applied entry
pub(crate) struct AppliedLog;

impl MetaKey for AppliedLog {
    const KEY: &'static str = "raft_applied_log";
    type Value = LogId<TypeConfig>;
}

/// Membership as of the last applied configuration entry
pub(crate) struct LastMembership;

impl MetaKey for LastMembership {
    const KEY: &'static str = "raft_membership";
    type Value = StoredMembership<TypeConfig>;
}

/// Id of the logical cluster
pub struct ClusterId;

impl MetaKey for ClusterId {
    const KEY: &'static str = "cluster_id";
    type Value = String;
}

#[cfg(test)]
pub(crate) fn test_log_id(term: u64, index: u64) -> LogId<TypeConfig> {
    openraft::testing::log_id::<TypeConfig>(term, "ctrl-a".to_string(), index)
}
