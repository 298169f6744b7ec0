//! Transport abstraction the mesh runs over

use async_trait::async_trait;
use bytes::Bytes;

use crate::MeshResult;

/// A bidirectional, message oriented connection.
///
/// `send` and `recv` may be called concurrently from different tasks.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Send one frame
    async fn send(&self, data: Bytes) -> MeshResult<()>;

    /// Receive the next frame
    async fn recv(&self) -> MeshResult<Bytes>;

    /// Close the connection; the remote side sees its `recv` fail
    async fn close(&self);
}

/// Accepts inbound connections
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next inbound connection
    async fn accept(&self) -> MeshResult<Box<dyn Connection>>;

    /// Address the listener is bound to
    fn local_address(&self) -> String;

    /// Stop accepting connections
    async fn close(&self);
}

/// Creates connections and listeners
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Dial `address`
    async fn connect(&self, address: &str) -> MeshResult<Box<dyn Connection>>;

    /// Listen on `address`
    async fn listen(&self, address: &str) -> MeshResult<Box<dyn Listener>>;
}
