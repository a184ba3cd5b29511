//! Abstract bidirectional byte channel to a single peer (C3).
//!
//! Two concrete variants exist: a direct point-to-point channel and a relay
//! channel that forwards enveloped messages through a known relay endpoint.
//! Both are modeled behind the same [`Transport`] trait so the connection
//! manager never needs to know which one it's holding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod tcp;

/// Where a transport is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportAddress {
    /// A direct peer-to-peer endpoint (host:port, or an ICE-negotiated path).
    Direct(String),
    /// A relay server endpoint plus the remote peer it forwards to.
    Relay { relay: String, peer: String },
}

/// Events a transport surfaces to its owner (the connection manager).
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    DataReceived(Vec<u8>),
    Error(String),
}

/// A bidirectional channel to one peer. Implementations own their own
/// background I/O; `next_event` is how the owner drains it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel. For the relay variant this also waits for the
    /// relay's `connected` acknowledgment before returning `Ok`.
    async fn connect(&self) -> Result<()>;

    /// Send raw bytes. Returns `Ok(())` iff the transport accepted them.
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Best-effort close.
    async fn disconnect(&self) -> Result<()>;

    /// Whether the channel is currently open.
    fn is_connected(&self) -> bool;

    /// Pull the next queued event, if any, without blocking.
    async fn next_event(&self) -> Option<TransportEvent>;
}

/// An in-process transport pair used by tests and by the relay variant's
/// loopback acknowledgment path. Each side holds the other's inbound queue.
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::sync::Mutex;

    pub struct MemoryTransport {
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
        connected: std::sync::atomic::AtomicBool,
    }

    impl MemoryTransport {
        /// Build a connected pair: bytes sent on one arrive as
        /// `TransportEvent::DataReceived` on the other.
        pub fn pair() -> (Self, Self) {
            let (a_tx, mut a_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let (b_tx, mut b_rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let (a_evt_tx, a_evt_rx) = mpsc::unbounded_channel();
            let (b_evt_tx, b_evt_rx) = mpsc::unbounded_channel();

            tokio::spawn(async move {
                while let Some(bytes) = a_rx.recv().await {
                    if b_evt_tx.send(TransportEvent::DataReceived(bytes)).is_err() {
                        break;
                    }
                }
            });
            tokio::spawn(async move {
                while let Some(bytes) = b_rx.recv().await {
                    if a_evt_tx.send(TransportEvent::DataReceived(bytes)).is_err() {
                        break;
                    }
                }
            });

            (
                Self {
                    outbound: a_tx,
                    inbound: Mutex::new(a_evt_rx),
                    connected: std::sync::atomic::AtomicBool::new(true),
                },
                Self {
                    outbound: b_tx,
                    inbound: Mutex::new(b_evt_rx),
                    connected: std::sync::atomic::AtomicBool::new(true),
                },
            )
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn connect(&self) -> Result<()> {
            self.connected
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        async fn send(&self, bytes: &[u8]) -> Result<()> {
            self.outbound
                .send(bytes.to_vec())
                .map_err(|_| crate::error::Error::TransportError("peer closed".into()))
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected
                .store(false, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn next_event(&self) -> Option<TransportEvent> {
            self.inbound.lock().await.recv().await
        }
    }
}
