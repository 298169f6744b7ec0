//! TCP transport with length-delimited frames

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info};

use crate::{Connection, Listener, MeshError, MeshResult, Transport};

/// TCP specific options
#[derive(Debug, Clone)]
pub struct TcpOptions {
    /// Largest frame accepted from a peer
    pub max_frame_length: usize,
    /// Bound on establishing the TCP connection itself
    pub connect_timeout: Duration,
    /// Whether to disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            max_frame_length: 64 * 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
            nodelay: true,
        }
    }
}

/// Transport over plain TCP
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    options: TcpOptions,
}

impl TcpTransport {
    /// Create a transport with `options`
    pub fn new(options: TcpOptions) -> Self {
        Self { options }
    }

    fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(self.options.max_frame_length)
            .new_codec()
    }

    fn wrap(&self, stream: TcpStream, remote: SocketAddr) -> MeshResult<TcpConnection> {
        stream.set_nodelay(self.options.nodelay)?;
        let (read, write) = stream.into_split();
        Ok(TcpConnection {
            remote,
            reader: Mutex::new(FramedRead::new(read, self.codec())),
            writer: Mutex::new(FramedWrite::new(write, self.codec())),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, address: &str) -> MeshResult<Box<dyn Connection>> {
        let stream = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| MeshError::Timeout(self.options.connect_timeout))??;
        let remote = stream.peer_addr()?;

        debug!("tcp connection established to {}", remote);
        Ok(Box::new(self.wrap(stream, remote)?))
    }

    async fn listen(&self, address: &str) -> MeshResult<Box<dyn Listener>> {
        let listener = TcpListener::bind(address).await?;
        let local = listener.local_addr()?;
        info!("tcp transport listening on {}", local);

        Ok(Box::new(TcpMeshListener {
            transport: self.clone(),
            listener,
            local,
        }))
    }
}

struct TcpConnection {
    remote: SocketAddr,
    reader: Mutex<FramedRead<OwnedReadHalf, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, data: Bytes) -> MeshResult<()> {
        self.writer.lock().await.send(data).await?;
        Ok(())
    }

    async fn recv(&self) -> MeshResult<Bytes> {
        match self.reader.lock().await.next().await {
            Some(Ok(frame)) => Ok(frame.freeze()),
            Some(Err(e)) => Err(e.into()),
            None => Err(MeshError::ConnectionClosed),
        }
    }

    async fn close(&self) {
        debug!("closing tcp connection to {}", self.remote);
        let _ = SinkExt::<Bytes>::close(&mut *self.writer.lock().await).await;
    }
}

struct TcpMeshListener {
    transport: TcpTransport,
    listener: TcpListener,
    local: SocketAddr,
}

#[async_trait]
impl Listener for TcpMeshListener {
    async fn accept(&self) -> MeshResult<Box<dyn Connection>> {
        let (stream, remote) = self.listener.accept().await?;
        debug!("accepted tcp connection from {}", remote);
        Ok(Box::new(self.transport.wrap(stream, remote)?))
    }

    fn local_address(&self) -> String {
        self.local.to_string()
    }

    async fn close(&self) {
        debug!("tcp listener on {} closing", self.local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_tcp() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let address = listener.local_address();

        let accept = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let frame = conn.recv().await.unwrap();
            conn.send(frame).await.unwrap();
            conn
        });

        let client = transport.connect(&address).await.unwrap();
        let payload = Bytes::from(vec![7u8; 100_000]);
        client.send(payload.clone()).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), payload);

        let _server = accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(transport.connect(&address).await.is_err());
    }
}
