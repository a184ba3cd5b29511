//! Shared harness for wiring driftnet nodes together over in-memory
//! transports without touching real sockets.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use driftnet::config::{ConnectionConfig, GossipConfig};
use driftnet::connection::{ConnectionManager, TransportFactory};
use driftnet::error::{Error, Result};
use driftnet::identity::{generate_node_id, KeyPair, NodeId};
use driftnet::transport::memory::MemoryTransport;
use driftnet::transport::{Transport, TransportAddress};
use driftnet::Orchestrator;

/// A `TransportFactory` that hands out pre-made transports stashed under a
/// link name, rather than dialing anything for real. Each stashed entry is
/// consumed exactly once, matching one `connect_to_peer` call per link.
pub struct MapFactory {
    pending: DashMap<String, MemoryTransport>,
}

impl MapFactory {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    pub fn stash(&self, link_name: &str, transport: MemoryTransport) {
        self.pending.insert(link_name.to_string(), transport);
    }
}

#[async_trait]
impl TransportFactory for MapFactory {
    async fn open(&self, address: &TransportAddress) -> Result<Arc<dyn Transport>> {
        let key = match address {
            TransportAddress::Direct(s) => s.clone(),
            TransportAddress::Relay { relay, .. } => relay.clone(),
        };
        let (_, transport) = self
            .pending
            .remove(&key)
            .ok_or_else(|| Error::TransportUnavailable(format!("no stashed transport for {key}")))?;
        Ok(Arc::new(transport))
    }
}

/// One driftnet node under test: identity, connection manager, and
/// orchestrator, ready to be linked to other nodes and run.
pub struct Node {
    pub id: NodeId,
    pub public_key: [u8; 32],
    pub connections: Arc<ConnectionManager>,
    pub orchestrator: Arc<Orchestrator>,
    factory: Arc<MapFactory>,
}

impl Node {
    pub fn new(gossip_config: GossipConfig) -> Self {
        let id = generate_node_id().expect("rng available in tests");
        let keys = KeyPair::generate();
        let public_key = keys.public_key_bytes();
        let factory = Arc::new(MapFactory::new());
        let connections = Arc::new(ConnectionManager::new(
            id.clone(),
            keys,
            ConnectionConfig::default(),
            50,
            factory.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(id.clone(), connections.clone(), gossip_config));
        Self {
            id,
            public_key,
            connections,
            orchestrator,
            factory,
        }
    }

    /// Spawn the orchestrator's event loop; returns the shutdown switch and
    /// the task handle so the caller can tear it down deterministically.
    pub fn spawn_run(&self) -> (tokio::sync::watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = tokio::sync::watch::channel(false);
        let orchestrator = self.orchestrator.clone();
        let handle = tokio::spawn(orchestrator.run(rx));
        (tx, handle)
    }
}

/// Connect `dialer` to `acceptor` over an in-memory pair: `dialer` goes
/// through the normal `connect_to_peer` path, `acceptor` registers the
/// other half as an inbound peer, mirroring what a real listener would do
/// after a handshake.
pub async fn link(dialer: &Node, acceptor: &Node, link_name: &str) {
    link_with_keys(dialer, acceptor, dialer.public_key, acceptor.public_key, link_name).await;
}

/// Like [`link`] but lets the caller lie about either side's declared
/// public key — used to exercise decryption rejection when a peer is
/// introduced under the wrong key.
pub async fn link_with_keys(
    dialer: &Node,
    acceptor: &Node,
    dialer_declared_public_key: [u8; 32],
    acceptor_declared_public_key: [u8; 32],
    link_name: &str,
) {
    let (dialer_side, acceptor_side) = MemoryTransport::pair();
    dialer.factory.stash(link_name, dialer_side);
    let connected = dialer
        .connections
        .connect_to_peer(
            acceptor.id.as_str(),
            acceptor_declared_public_key,
            TransportAddress::Direct(link_name.to_string()),
        )
        .await
        .expect("connect_to_peer should not error for a stashed link");
    assert!(connected, "expected {link_name} to connect");

    acceptor
        .connections
        .register_inbound_peer(
            dialer.id.clone(),
            dialer_declared_public_key,
            TransportAddress::Direct(link_name.to_string()),
            Arc::new(acceptor_side),
        )
        .await;
}

pub async fn shutdown_all(handles: Vec<(tokio::sync::watch::Sender<bool>, tokio::task::JoinHandle<()>)>) {
    for (tx, handle) in handles {
        let _ = tx.send(true);
        let _ = handle.await;
    }
}

/// An extension that records every message it's handed, for assertions in
/// black-box tests that can't reach the orchestrator's private pipeline.
pub struct CaptureExtension {
    id: String,
    kinds: Vec<driftnet::protocol::MessageKind>,
    received: tokio::sync::Mutex<Vec<driftnet::protocol::Message>>,
}

impl CaptureExtension {
    pub fn new(id: &str, kinds: Vec<driftnet::protocol::MessageKind>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kinds,
            received: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub async fn received(&self) -> Vec<driftnet::protocol::Message> {
        self.received.lock().await.clone()
    }
}

#[async_trait]
impl driftnet::extension::Extension for CaptureExtension {
    fn identifier(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn supported_kinds(&self) -> &[driftnet::protocol::MessageKind] {
        &self.kinds
    }

    async fn handle_message(&self, message: &driftnet::protocol::Message, _peer: &NodeId) -> Result<()> {
        self.received.lock().await.push(message.clone());
        Ok(())
    }
}
