//! In-memory transport for tests and single-process clusters.
//!
//! Listeners register with a [`MemoryHub`] that the caller creates and hands
//! to every [`MemoryTransport`] that should be able to reach each other, so
//! independent clusters in the same process never see each other.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{Connection, Listener, MeshError, MeshResult, Transport};

const CHANNEL_CAPACITY: usize = 256;

/// Registry of in-memory listeners keyed by address
#[derive(Debug, Default)]
pub struct MemoryHub {
    listeners: DashMap<String, flume::Sender<Box<dyn Connection>>>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether something listens at `address`
    pub fn is_listening(&self, address: &str) -> bool {
        self.listeners.contains_key(address)
    }
}

/// Transport routing connections through a [`MemoryHub`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    /// Create a transport attached to `hub`
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, address: &str) -> MeshResult<Box<dyn Connection>> {
        let incoming = self
            .hub
            .listeners
            .get(address)
            .map(|l| l.clone())
            .ok_or_else(|| MeshError::NoListener(address.to_string()))?;

        let (client_tx, server_rx) = flume::bounded(CHANNEL_CAPACITY);
        let (server_tx, client_rx) = flume::bounded(CHANNEL_CAPACITY);
        let id = Uuid::new_v4();

        let server = MemoryConnection::new(id, server_tx, server_rx);
        incoming
            .send_async(Box::new(server))
            .await
            .map_err(|_| MeshError::NoListener(address.to_string()))?;

        debug!("memory connection {} established to {}", id, address);
        Ok(Box::new(MemoryConnection::new(id, client_tx, client_rx)))
    }

    async fn listen(&self, address: &str) -> MeshResult<Box<dyn Listener>> {
        let (tx, rx) = flume::unbounded();

        match self.hub.listeners.entry(address.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MeshError::AddressInUse(address.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        debug!("memory listener created at {}", address);
        Ok(Box::new(MemoryListener {
            hub: self.hub.clone(),
            address: address.to_string(),
            incoming: rx,
        }))
    }
}

struct MemoryConnection {
    id: Uuid,
    sender: Mutex<Option<flume::Sender<Bytes>>>,
    receiver: flume::Receiver<Bytes>,
}

impl MemoryConnection {
    fn new(id: Uuid, sender: flume::Sender<Bytes>, receiver: flume::Receiver<Bytes>) -> Self {
        Self {
            id,
            sender: Mutex::new(Some(sender)),
            receiver,
        }
    }
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, data: Bytes) -> MeshResult<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or(MeshError::ConnectionClosed)?;

        sender
            .send_async(data)
            .await
            .map_err(|_| MeshError::ConnectionClosed)
    }

    async fn recv(&self) -> MeshResult<Bytes> {
        self.receiver
            .recv_async()
            .await
            .map_err(|_| MeshError::ConnectionClosed)
    }

    async fn close(&self) {
        debug!("closing memory connection {}", self.id);
        self.sender.lock().take();
    }
}

struct MemoryListener {
    hub: Arc<MemoryHub>,
    address: String,
    incoming: flume::Receiver<Box<dyn Connection>>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> MeshResult<Box<dyn Connection>> {
        self.incoming
            .recv_async()
            .await
            .map_err(|_| MeshError::ConnectionClosed)
    }

    fn local_address(&self) -> String {
        self.address.clone()
    }

    async fn close(&self) {
        debug!("closing memory listener at {}", self.address);
        self.hub.listeners.remove(&self.address);
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.hub.listeners.remove(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_and_connect() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub.clone());

        let listener = transport.listen("ctrl-a:6262").await.unwrap();
        assert!(hub.is_listening("ctrl-a:6262"));

        let client = transport.connect("ctrl-a:6262").await.unwrap();
        let server = listener.accept().await.unwrap();

        client.send(Bytes::from("ping")).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Bytes::from("ping"));

        server.send(Bytes::from("pong")).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Bytes::from("pong"));

        client.close().await;
        assert!(matches!(
            server.recv().await,
            Err(MeshError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_address_in_use_and_missing_listener() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub.clone());

        let listener = transport.listen("ctrl-a:6262").await.unwrap();
        assert!(matches!(
            transport.listen("ctrl-a:6262").await,
            Err(MeshError::AddressInUse(_))
        ));
        assert!(matches!(
            transport.connect("ctrl-b:6262").await,
            Err(MeshError::NoListener(_))
        ));

        listener.close().await;
        assert!(!hub.is_listening("ctrl-a:6262"));
    }

    #[tokio::test]
    async fn test_hubs_are_isolated() {
        let first = MemoryTransport::new(MemoryHub::new());
        let second = MemoryTransport::new(MemoryHub::new());

        let _listener = first.listen("ctrl-a:6262").await.unwrap();
        assert!(second.connect("ctrl-a:6262").await.is_err());
    }
}
