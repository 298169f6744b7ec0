//! Error types for the controller

use std::time::Duration;

use fabric_command::{ApiError, CodecError};
use fabric_db::DbError;
use fabric_mesh::MeshError;
use thiserror::Error;

/// Result type for controller operations
pub type ControllerResult<T> = Result<T, Error>;

/// Controller errors
#[derive(Debug, Error)]
pub enum Error {
    /// The command rejected its own input before reaching the log
    #[error("validation failed: {0}")]
    Validation(ApiError),

    /// Members run incompatible versions, so nothing may be written
    #[error("cluster is read-only: members run incompatible versions")]
    ReadOnly,

    /// No leader is currently known
    #[error("no leader is currently known")]
    NoLeader,

    /// The operation must run on the leader
    #[error("not leader, current leader is {leader:?}")]
    NotLeader {
        /// The current leader id, if known
        leader: Option<String>,
    },

    /// A bounded wait elapsed
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// The bound that elapsed
        after: Duration,
    },

    /// The in-flight apply ceiling was reached
    #[error("too many updates in flight, try again later")]
    TooManyUpdates,

    /// The command was replicated but its application was rejected
    #[error(transparent)]
    Api(ApiError),

    /// The consensus engine failed
    #[error("raft error: {0}")]
    Raft(String),

    /// Durable store failure
    #[error("storage error: {0}")]
    Storage(#[from] DbError),

    /// Mesh failure
    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),

    /// Command encoding failure
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A peer replied with something the protocol does not allow
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A peer replied with an error that is not an API error
    #[error("remote error (code {code}): {message}")]
    Remote {
        /// Wire error code
        code: u32,
        /// Plain text body
        message: String,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The controller has been shut down
    #[error("controller is shut down")]
    Shutdown,
}

impl Error {
    /// Whether the error is [`Error::NotLeader`] or [`Error::NoLeader`]
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::NotLeader { .. } | Self::NoLeader)
    }

    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoLeader
                | Self::NotLeader { .. }
                | Self::Timeout { .. }
                | Self::TooManyUpdates
                | Self::Mesh(_)
        )
    }

    /// The structured error, for validation and application failures
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Validation(e) | Self::Api(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }
}
