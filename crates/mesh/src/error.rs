//! Error types for the mesh

use std::time::Duration;

use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

/// Mesh errors
#[derive(Debug, Error)]
pub enum MeshError {
    /// I/O failure on the underlying transport
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport specific failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Nothing is listening at the address
    #[error("no listener at {0}")]
    NoListener(String),

    /// An address is already being listened on
    #[error("address {0} is already in use")]
    AddressInUse(String),

    /// The connection was closed
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation did not finish in time
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The peer did not complete the handshake correctly
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A frame could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// The remote side could not handle the request
    #[error("remote error: {0}")]
    Remote(String),

    /// Attempt to dial the local member
    #[error("refusing to connect to own address {0}")]
    SelfConnect(String),

    /// The mesh has been shut down
    #[error("mesh is shut down")]
    Shutdown,
}
