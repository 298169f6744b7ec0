//! A connected cluster member

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::frame::Frame;
use crate::{CONTENT_TYPE_MESH_ERROR, Connection, Hello, MeshError, MeshResult, Message};

/// A member reachable over an established connection
pub struct Peer {
    hello: Hello,
    conn: Arc<dyn Connection>,
    pending: DashMap<Uuid, oneshot::Sender<Message>>,
    closed: CancellationToken,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.hello.id)
            .field("address", &self.hello.address)
            .field("version", &self.hello.version)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Peer {
    pub(crate) fn new(hello: Hello, conn: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            hello,
            conn,
            pending: DashMap::new(),
            closed: CancellationToken::new(),
        })
    }

    /// Member id announced in the handshake
    pub fn id(&self) -> &str {
        &self.hello.id
    }

    /// Address announced in the handshake
    pub fn address(&self) -> &str {
        &self.hello.address
    }

    /// Version announced in the handshake
    pub fn version(&self) -> &str {
        &self.hello.version
    }

    /// Whether the connection is still open
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Send `message` and wait up to `timeout` for the correlated reply.
    ///
    /// A reply of type [`CONTENT_TYPE_MESH_ERROR`] becomes
    /// [`MeshError::Remote`].
    pub async fn request(&self, message: Message, timeout: Duration) -> MeshResult<Message> {
        if !self.is_connected() {
            return Err(MeshError::ConnectionClosed);
        }

        let correlation = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation, tx);

        let exchange = async {
            let frame = Frame::Request {
                correlation,
                message,
            }
            .encode()?;
            self.conn.send(frame).await?;
            rx.await.map_err(|_| MeshError::ConnectionClosed)
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::Timeout(timeout)),
        };

        match result {
            Ok(reply) if reply.content_type == CONTENT_TYPE_MESH_ERROR => {
                Err(MeshError::Remote(reply.body_text()))
            }
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.pending.remove(&correlation);
                Err(e)
            }
        }
    }

    pub(crate) async fn recv(&self) -> MeshResult<Frame> {
        let data = tokio::select! {
            _ = self.closed.cancelled() => return Err(MeshError::ConnectionClosed),
            data = self.conn.recv() => data?,
        };
        Frame::decode(&data)
    }

    pub(crate) async fn reply(&self, correlation: Uuid, message: Message) -> MeshResult<()> {
        let frame = Frame::Reply {
            correlation,
            message,
        }
        .encode()?;
        self.conn.send(frame).await
    }

    pub(crate) fn complete(&self, correlation: Uuid, message: Message) {
        match self.pending.remove(&correlation) {
            Some((_, tx)) => {
                let _ = tx.send(message);
            }
            None => debug!(
                "dropping reply {} from {} with no waiting request",
                correlation, self.hello.id
            ),
        }
    }

    pub(crate) async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        // dropping the senders fails every outstanding request
        self.pending.clear();
        self.conn.close().await;
    }
}
