//! Peer table, handshake and request routing

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::Frame;
use crate::{
    Connection, ContentType, Hello, Listener, MeshError, MeshResult, Message, Peer, Transport,
};

type Handler = Arc<dyn Fn(Arc<Peer>, Message) -> BoxFuture<'static, Message> + Send + Sync>;

const EVENT_CAPACITY: usize = 256;

/// Mesh configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Local member id
    pub id: String,
    /// Address other members dial to reach this one
    pub advertise_address: String,
    /// Address to bind; defaults to the advertise address
    pub listen_address: Option<String>,
    /// Local software version, compared against every peer
    pub version: String,
    /// Bound on completing the handshake of an inbound connection
    pub handshake_timeout: Duration,
}

impl MeshConfig {
    /// Configuration listening on the advertise address
    pub fn new(
        id: impl Into<String>,
        advertise_address: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            advertise_address: advertise_address.into(),
            listen_address: None,
            version: version.into(),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Peer lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A peer completed the handshake
    PeerConnected {
        /// Peer id
        id: String,
        /// Advertised address
        address: String,
        /// Peer version
        version: String,
    },
    /// A peer's connection closed
    PeerDisconnected {
        /// Peer id
        id: String,
        /// Advertised address
        address: String,
    },
}

/// Whether members running `local` and `remote` may both accept writes.
///
/// Semantic versions are compatible when major and minor match; anything that
/// does not parse must match exactly.
pub fn versions_compatible(local: &str, remote: &str) -> bool {
    let parse = |v: &str| semver::Version::parse(v.trim_start_matches('v'));
    match (parse(local), parse(remote)) {
        (Ok(l), Ok(r)) => l.major == r.major && l.minor == r.minor,
        _ => local == remote,
    }
}

/// Connections to every known cluster member.
///
/// Cloning is cheap; all clones share the same peer table. Call
/// [`Mesh::shutdown`] to stop background tasks.
#[derive(Clone)]
pub struct Mesh {
    inner: Arc<MeshInner>,
}

struct MeshInner {
    config: MeshConfig,
    local_address: String,
    transport: Arc<dyn Transport>,
    peers: DashMap<String, Arc<Peer>>,
    handlers: DashMap<ContentType, Handler>,
    dialing: DashMap<String, Arc<Mutex<()>>>,
    read_only: watch::Sender<bool>,
    events: broadcast::Sender<MeshEvent>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("id", &self.inner.config.id)
            .field("address", &self.inner.config.advertise_address)
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}

impl Mesh {
    /// Start listening and accepting peers
    pub async fn start(config: MeshConfig, transport: Arc<dyn Transport>) -> MeshResult<Self> {
        let bind = config
            .listen_address
            .clone()
            .unwrap_or_else(|| config.advertise_address.clone());
        let listener = transport.listen(&bind).await?;
        let local_address = listener.local_address();

        let (read_only, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let mesh = Self {
            inner: Arc::new(MeshInner {
                config,
                local_address,
                transport,
                peers: DashMap::new(),
                handlers: DashMap::new(),
                dialing: DashMap::new(),
                read_only,
                events,
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        };

        info!(
            "mesh {} listening on {} (advertised as {})",
            mesh.inner.config.id, mesh.inner.local_address, mesh.inner.config.advertise_address
        );

        let acceptor = mesh.clone();
        mesh.inner
            .tasks
            .spawn(async move { acceptor.accept_loop(listener).await });

        Ok(mesh)
    }

    /// Local member id
    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// Advertised address
    pub fn advertise_address(&self) -> &str {
        &self.inner.config.advertise_address
    }

    /// Address the listener is actually bound to
    pub fn local_address(&self) -> &str {
        &self.inner.local_address
    }

    /// Local software version
    pub fn version(&self) -> &str {
        &self.inner.config.version
    }

    /// Route requests of `content_type` to `handler`.
    ///
    /// The handler is invoked on the connection's reader task, in arrival
    /// order; only the future it returns runs concurrently. Work that must
    /// preserve arrival order belongs before the returned future.
    pub fn handle<F>(&self, content_type: ContentType, handler: F)
    where
        F: Fn(Arc<Peer>, Message) -> BoxFuture<'static, Message> + Send + Sync + 'static,
    {
        self.inner.handlers.insert(content_type, Arc::new(handler));
    }

    /// Connected peer with id `id`
    pub fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.inner
            .peers
            .get(id)
            .map(|p| p.clone())
            .filter(|p| p.is_connected())
    }

    /// Every connected peer
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner
            .peers
            .iter()
            .map(|p| p.value().clone())
            .filter(|p| p.is_connected())
            .collect()
    }

    /// Whether a connected peer runs an incompatible version
    pub fn is_read_only(&self) -> bool {
        *self.inner.read_only.borrow()
    }

    /// Observe read-only transitions
    pub fn subscribe_read_only(&self) -> watch::Receiver<bool> {
        self.inner.read_only.subscribe()
    }

    /// Observe peer connects and disconnects
    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    /// Return the peer at `address`, dialing it if needed
    pub async fn get_or_connect(&self, address: &str, timeout: Duration) -> MeshResult<Arc<Peer>> {
        if self.inner.cancel.is_cancelled() {
            return Err(MeshError::Shutdown);
        }
        if address == self.inner.config.advertise_address || address == self.inner.local_address {
            return Err(MeshError::SelfConnect(address.to_string()));
        }
        if let Some(peer) = self.peer_at(address) {
            return Ok(peer);
        }

        tokio::time::timeout(timeout, self.dial(address))
            .await
            .map_err(|_| MeshError::Timeout(timeout))?
    }

    /// Close every connection and stop accepting new ones
    pub async fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        info!("mesh {} shutting down", self.inner.config.id);
        self.inner.cancel.cancel();

        let peers: Vec<_> = self.inner.peers.iter().map(|p| p.value().clone()).collect();
        for peer in peers {
            peer.close().await;
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    fn peer_at(&self, address: &str) -> Option<Arc<Peer>> {
        self.inner
            .peers
            .iter()
            .find(|p| p.address() == address && p.is_connected())
            .map(|p| p.value().clone())
    }

    fn local_hello(&self) -> Hello {
        Hello {
            id: self.inner.config.id.clone(),
            address: self.inner.config.advertise_address.clone(),
            version: self.inner.config.version.clone(),
        }
    }

    async fn dial(&self, address: &str) -> MeshResult<Arc<Peer>> {
        let lock = self
            .inner
            .dialing
            .entry(address.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.dial_locked(address).await
        };

        if result.is_ok() {
            // later callers find the peer without taking the lock
            self.inner
                .dialing
                .remove_if(address, |_, current| Arc::ptr_eq(current, &lock));
        }
        result
    }

    async fn dial_locked(&self, address: &str) -> MeshResult<Arc<Peer>> {
        // another caller may have finished dialing while we waited
        if let Some(peer) = self.peer_at(address) {
            return Ok(peer);
        }

        debug!("mesh {} dialing {}", self.inner.config.id, address);
        let conn: Arc<dyn Connection> = Arc::from(self.inner.transport.connect(address).await?);

        conn.send(Frame::Hello(self.local_hello()).encode()?).await?;
        let hello = match read_hello(conn.as_ref()).await {
            Ok(hello) => hello,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };

        if hello.id == self.inner.config.id {
            conn.close().await;
            return Err(MeshError::SelfConnect(address.to_string()));
        }

        Ok(self.register(hello, conn))
    }

    async fn accept_loop(self, listener: Box<dyn Listener>) {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    let mesh = self.clone();
                    self.inner.tasks.spawn(async move {
                        if let Err(e) = mesh.accept_handshake(Arc::from(conn)).await {
                            warn!("inbound handshake failed: {}", e);
                        }
                    });
                }
                Err(MeshError::ConnectionClosed) => break,
                Err(e) => {
                    warn!("failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        listener.close().await;
        debug!("mesh {} stopped accepting", self.inner.config.id);
    }

    async fn accept_handshake(&self, conn: Arc<dyn Connection>) -> MeshResult<()> {
        let timeout = self.inner.config.handshake_timeout;
        let hello = match tokio::time::timeout(timeout, read_hello(conn.as_ref())).await {
            Ok(Ok(hello)) => hello,
            Ok(Err(e)) => {
                conn.close().await;
                return Err(e);
            }
            Err(_) => {
                conn.close().await;
                return Err(MeshError::Timeout(timeout));
            }
        };

        conn.send(Frame::Hello(self.local_hello()).encode()?).await?;
        self.register(hello, conn);
        Ok(())
    }

    fn register(&self, hello: Hello, conn: Arc<dyn Connection>) -> Arc<Peer> {
        let peer = Peer::new(hello, conn);

        // A second connection to a live peer (both sides dialing at once)
        // is served but does not replace the tracked one.
        let tracked = match self.inner.peers.entry(peer.id().to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().is_connected() {
                    false
                } else {
                    slot.insert(peer.clone());
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(peer.clone());
                true
            }
        };

        let reader = self.clone();
        let served = peer.clone();
        self.inner
            .tasks
            .spawn(async move { reader.serve(served).await });

        if tracked {
            info!(
                "peer {} connected at {} running {}",
                peer.id(),
                peer.address(),
                peer.version()
            );
            let _ = self.inner.events.send(MeshEvent::PeerConnected {
                id: peer.id().to_string(),
                address: peer.address().to_string(),
                version: peer.version().to_string(),
            });
            self.refresh_read_only();
        }

        peer
    }

    async fn serve(self, peer: Arc<Peer>) {
        loop {
            let frame = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                frame = peer.recv() => frame,
            };

            match frame {
                Ok(Frame::Request {
                    correlation,
                    message,
                }) => self.route(peer.clone(), correlation, message),
                Ok(Frame::Reply {
                    correlation,
                    message,
                }) => peer.complete(correlation, message),
                Ok(Frame::Hello(_)) => {
                    warn!("ignoring repeated handshake from {}", peer.id());
                }
                Err(MeshError::Codec(e)) => {
                    warn!("dropping undecodable frame from {}: {}", peer.id(), e);
                }
                Err(e) => {
                    debug!("connection to {} ended: {}", peer.id(), e);
                    break;
                }
            }
        }

        peer.close().await;

        let removed = self
            .inner
            .peers
            .remove_if(peer.id(), |_, tracked| Arc::ptr_eq(tracked, &peer))
            .is_some();
        if removed {
            info!("peer {} disconnected", peer.id());
            let _ = self.inner.events.send(MeshEvent::PeerDisconnected {
                id: peer.id().to_string(),
                address: peer.address().to_string(),
            });
            self.refresh_read_only();
        }
    }

    fn route(&self, peer: Arc<Peer>, correlation: Uuid, message: Message) {
        let handler = self
            .inner
            .handlers
            .get(&message.content_type)
            .map(|h| h.clone());

        let reply: BoxFuture<'static, Message> = match handler {
            Some(handler) => handler(peer.clone(), message),
            None => {
                let reason = format!("no handler for content type {}", message.content_type);
                debug!("{} requested by {}", reason, peer.id());
                Box::pin(std::future::ready(Message::mesh_error(reason)))
            }
        };

        self.inner.tasks.spawn(async move {
            let reply = reply.await;
            if let Err(e) = peer.reply(correlation, reply).await {
                debug!("failed to reply to {}: {}", peer.id(), e);
            }
        });
    }

    fn refresh_read_only(&self) {
        let local = &self.inner.config.version;
        let incompatible: Vec<String> = self
            .peers()
            .iter()
            .filter(|p| !versions_compatible(local, p.version()))
            .map(|p| format!("{}@{}", p.id(), p.version()))
            .collect();
        let read_only = !incompatible.is_empty();

        let changed = self.inner.read_only.send_if_modified(|current| {
            if *current == read_only {
                return false;
            }
            *current = read_only;
            true
        });

        if changed && read_only {
            warn!(
                "cluster is read-only: peers {:?} run a version incompatible with {}",
                incompatible, local
            );
        } else if changed {
            info!("all peers run compatible versions, cluster is read-write");
        }
    }
}

async fn read_hello(conn: &dyn Connection) -> MeshResult<Hello> {
    let data = conn.recv().await?;
    match Frame::decode(&data)? {
        Frame::Hello(hello) => Ok(hello),
        _ => Err(MeshError::Handshake(
            "first frame was not a hello".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryHub, MemoryTransport};

    async fn start(hub: &Arc<MemoryHub>, id: &str) -> Mesh {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(hub.clone()));
        Mesh::start(MeshConfig::new(id, format!("{id}:6262"), "1.0.0"), transport)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_dial_locks_are_released() {
        let hub = MemoryHub::new();
        let a = start(&hub, "ctrl-a").await;
        let b = start(&hub, "ctrl-b").await;
        let timeout = Duration::from_secs(2);

        let (first, second) = tokio::join!(
            a.get_or_connect("ctrl-b:6262", timeout),
            a.get_or_connect("ctrl-b:6262", timeout),
        );
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert!(a.inner.dialing.is_empty());

        // a failed dial may be retried under the same lock
        assert!(a.get_or_connect("ctrl-x:6262", timeout).await.is_err());
        assert!(a.inner.dialing.contains_key("ctrl-x:6262"));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[test]
    fn test_versions_compatible() {
        assert!(versions_compatible("1.4.0", "1.4.7"));
        assert!(versions_compatible("v1.4.0", "1.4.2"));
        assert!(!versions_compatible("1.4.0", "1.5.0"));
        assert!(!versions_compatible("2.0.0", "1.0.0"));
        assert!(versions_compatible("dev", "dev"));
        assert!(!versions_compatible("dev", "1.0.0"));
    }
}
