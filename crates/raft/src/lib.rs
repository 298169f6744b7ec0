//! Raft-backed controller for the fabric control plane.
//!
//! Every state change is a [`Command`](fabric_command::Command) appended to a
//! replicated log and applied, in log order, to a durable store on every
//! controller. Any controller accepts commands through
//! [`Controller::dispatch`]: the leader applies them directly, followers
//! forward them over the mesh and return once their own state machine has
//! caught up, so a caller can always read its own writes locally.
//!
//! Beyond dispatch the controller manages cluster membership (join, add and
//! remove peers, leadership transfer), bootstraps brand new clusters,
//! snapshots and restores the state machine, and reports leadership and
//! read-only transitions as [`ClusterEvent`]s.
#![warn(missing_docs)]
#![warn(clippy::all)]

mod commands;
mod config;
mod controller;
mod error;
mod events;
mod fsm;
mod index_tracker;
mod log_store;
pub mod messages;
mod network;
mod rate_limiter;
mod types;

pub use commands::InitClusterIdCommand;
pub use config::{CommandHandlerConfig, ControllerConfig, RaftSettings, RateLimiterConfig};
pub use controller::Controller;
pub use error::{ControllerResult, Error};
pub use events::{ClusterEvent, ClusterEventHandler};
pub use fsm::Fsm;
pub use index_tracker::IndexTracker;
pub use log_store::LogStore;
pub use messages::{AddPeerRequest, RemovePeerRequest, TransferLeadershipRequest};
pub use rate_limiter::{RateLimitPermit, RateLimiter};
pub use types::{
    ApplyResult, ClusterId, CommandPayload, ControllerRaft, Member, Server, ServersWithIndex,
    TypeConfig,
};
