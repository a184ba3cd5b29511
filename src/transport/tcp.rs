//! TCP-backed `Transport` implementation used as driftnet's direct variant.
//!
//! Frames are length-prefixed (4-byte big-endian length + payload) so a
//! single `TcpStream` carries a sequence of whole messages rather than a
//! raw byte stream. A relay connection uses the same framing; the only
//! difference is which address the caller dials and how the caller
//! interprets the bytes (see [`crate::connection::envelope`] callers).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportAddress, TransportEvent};

const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// A TCP-backed transport handle. `TcpStream` has no portable clone, so the
/// transport owns a single stream and multiplexes it between a reader task
/// (via `into_split`) and the writer half kept for `send`.
pub struct TcpTransportHandle {
    write_half: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    events: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    connected: AtomicBool,
}

impl TcpTransportHandle {
    pub fn new(stream: TcpStream) -> Self {
        let (mut read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 4];
                if read_half.read_exact(&mut len_buf).await.is_err() {
                    let _ = tx.send(TransportEvent::Disconnected {
                        reason: "connection closed".to_string(),
                    });
                    break;
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len > MAX_FRAME_BYTES {
                    let _ = tx.send(TransportEvent::Error("frame too large".to_string()));
                    break;
                }
                let mut buf = vec![0u8; len];
                if read_half.read_exact(&mut buf).await.is_err() {
                    let _ = tx.send(TransportEvent::Disconnected {
                        reason: "connection closed mid-frame".to_string(),
                    });
                    break;
                }
                if tx.send(TransportEvent::DataReceived(buf)).is_err() {
                    break;
                }
            }
        });

        Self {
            write_half: Mutex::new(write_half),
            events: Mutex::new(rx),
            connected: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Transport for TcpTransportHandle {
    async fn connect(&self) -> Result<()> {
        // The stream is already open by construction; nothing further to do.
        Ok(())
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        let len = (bytes.len() as u32).to_be_bytes();
        write_half
            .write_all(&len)
            .await
            .map_err(|e| Error::TransportError(e.to_string()))?;
        write_half
            .write_all(bytes)
            .await
            .map_err(|e| Error::TransportError(e.to_string()))?;
        write_half
            .flush()
            .await
            .map_err(|e| Error::TransportError(e.to_string()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }
}

/// Opens direct TCP connections for `TransportAddress::Direct("host:port")`
/// and relay connections for `TransportAddress::Relay { relay, .. }`,
/// sending the relay's `connect` envelope and letting the manager's
/// `connect_to_peer` wait for the `connected` acknowledgment as a normal
/// inbound event.
pub struct TcpTransportFactory {
    local_node_id: String,
}

impl TcpTransportFactory {
    pub fn new(local_node_id: String) -> Self {
        Self { local_node_id }
    }
}

#[async_trait]
impl crate::connection::TransportFactory for TcpTransportFactory {
    async fn open(&self, address: &TransportAddress) -> Result<Arc<dyn Transport>> {
        match address {
            TransportAddress::Direct(addr) => {
                let socket_addr: SocketAddr = addr
                    .parse()
                    .map_err(|e| Error::TransportUnavailable(format!("bad address {addr}: {e}")))?;
                let stream = TcpStream::connect(socket_addr)
                    .await
                    .map_err(|e| Error::TransportUnavailable(format!("connect {addr}: {e}")))?;
                Ok(Arc::new(TcpTransportHandle::new(stream)))
            }
            TransportAddress::Relay { relay, peer } => {
                let socket_addr: SocketAddr = relay
                    .parse()
                    .map_err(|e| Error::TransportUnavailable(format!("bad relay {relay}: {e}")))?;
                let stream = TcpStream::connect(socket_addr)
                    .await
                    .map_err(|e| Error::TransportUnavailable(format!("connect {relay}: {e}")))?;
                let handle = TcpTransportHandle::new(stream);
                let envelope = serde_json::json!({
                    "type": "connect",
                    "from": self.local_node_id,
                    "to": peer,
                });
                handle.send(&serde_json::to_vec(&envelope)?).await?;
                Ok(Arc::new(handle))
            }
        }
    }
}

/// Listens for inbound direct connections. Each accepted socket is expected
/// to open with a `Hello` envelope `{node_id, public_key}` (32-byte public
/// key as an array of unsigned bytes) identifying the remote peer; sockets
/// that don't send one within `hello_timeout` are dropped.
pub async fn listen(
    bind_addr: SocketAddr,
    manager: Arc<crate::connection::ConnectionManager>,
    hello_timeout: std::time::Duration,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| Error::TransportUnavailable(format!("bind {bind_addr}: {e}")))?;
    tracing::info!(addr = %bind_addr, "listening for inbound peers");

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_one(stream, remote, manager, hello_timeout).await {
                tracing::warn!(peer = %remote, error = %e, "inbound handshake failed");
            }
        });
    }
}

async fn accept_one(
    stream: TcpStream,
    remote: SocketAddr,
    manager: Arc<crate::connection::ConnectionManager>,
    hello_timeout: std::time::Duration,
) -> Result<()> {
    let handle = Arc::new(TcpTransportHandle::new(stream));
    let event = tokio::time::timeout(hello_timeout, handle.next_event())
        .await
        .map_err(|_| Error::TransportError("no hello within timeout".to_string()))?
        .ok_or_else(|| Error::TransportError("peer closed before hello".to_string()))?;

    let TransportEvent::DataReceived(bytes) = event else {
        return Err(Error::TransportError(format!(
            "expected hello data, got {event:?}"
        )));
    };

    #[derive(serde::Deserialize)]
    struct Hello {
        node_id: String,
        public_key: [u8; 32],
    }
    let hello: Hello = serde_json::from_slice(&bytes)
        .map_err(|e| Error::TransportError(format!("malformed hello from {remote}: {e}")))?;
    let peer_id: crate::identity::NodeId = hello.node_id.parse()?;

    manager
        .register_inbound_peer(
            peer_id,
            hello.public_key,
            TransportAddress::Direct(remote.to_string()),
            handle,
        )
        .await;
    Ok(())
}
