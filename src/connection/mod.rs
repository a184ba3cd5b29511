//! Per-peer connection state, key agreement, encryption envelope, and
//! heartbeats (C4).

pub mod envelope;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::identity::{KeyPair, NodeId};
use crate::protocol::{self, Body, ConstructOptions, Message, MessageKind};
use crate::transport::{Transport, TransportAddress, TransportEvent};
use envelope::EnvelopeKeys;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

/// Per-peer state machine, transitioned only by the manager's internal
/// event handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Relaying,
    Error(String),
}

/// Rolling connection quality for a peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quality {
    pub latency_ms: u64,
    pub relative_bandwidth: f32,
    pub reliability: f32,
}

/// Per-peer record held by the manager. Mutated only by internal event
/// handlers; extensions only ever see a read-only snapshot.
pub struct PeerRecord {
    pub node_id: NodeId,
    pub state: PeerState,
    pub address: TransportAddress,
    pub public_key: [u8; 32],
    pub last_seen_ms: u64,
    pub last_ping_ms: Option<u64>,
    pub latency_ms: Option<u64>,
    pub quality: Quality,
    pub supported_kinds: HashSet<MessageKind>,
}

struct PeerEntry {
    record: RwLock<PeerRecord>,
    transport: Arc<dyn Transport>,
}

/// Events the manager emits to its owner (the orchestrator). Delivered
/// synchronously with respect to the triggering transport event.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { peer: NodeId },
    Disconnected { peer: NodeId, reason: String },
    Message { message: Message, peer: NodeId },
    Error { peer: Option<NodeId>, error: String },
}

/// Opens the concrete transport for an address. Direct vs relay strategy
/// selection, and whatever platform-specific facility (ICE/STUN) a direct
/// attempt requires, lives behind this seam so the manager stays
/// transport-agnostic.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, address: &TransportAddress) -> Result<Arc<dyn Transport>>;
}

/// Owns transport handles and per-peer state. The only component allowed to
/// mutate the peer table.
pub struct ConnectionManager {
    local_node_id: NodeId,
    keys: Arc<EnvelopeKeys>,
    config: ConnectionConfig,
    peers: Arc<DashMap<NodeId, PeerEntry>>,
    factory: Arc<dyn TransportFactory>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: RwLock<mpsc::UnboundedReceiver<ConnectionEvent>>,
    max_peers: usize,
    messages_received: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        local_node_id: NodeId,
        local_keypair: KeyPair,
        config: ConnectionConfig,
        max_peers: usize,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            local_node_id,
            keys: Arc::new(EnvelopeKeys::new(local_keypair)),
            config,
            peers: Arc::new(DashMap::new()),
            factory,
            events_tx,
            events_rx: RwLock::new(events_rx),
            max_peers,
            messages_received: AtomicU64::new(0),
        }
    }

    pub fn local_public_key(&self) -> [u8; 32] {
        self.keys.local_public_key()
    }

    /// The configured heartbeat period, used by the orchestrator to drive
    /// `heartbeat_tick` on the right cadence rather than piggybacking on
    /// the gossip interval.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        self.config.heartbeat_interval_ms
    }

    /// Pull the next connection event, awaiting if none is queued yet.
    pub async fn next_event(&self) -> Option<ConnectionEvent> {
        self.events_rx.write().await.recv().await
    }

    pub fn connected_peer_ids(&self) -> Vec<NodeId> {
        self.peers
            .iter()
            .filter(|e| matches!(e.record.try_read().map(|r| r.state.clone()), Ok(PeerState::Connected) | Ok(PeerState::Relaying)))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Mean heartbeat-measured `latency_ms` across peers that have answered
    /// at least one ping. `0.0` if no peer has a recorded latency yet.
    pub fn average_latency_ms(&self) -> f64 {
        let (total, count) = self.peers.iter().fold((0u64, 0u64), |(total, count), e| {
            match e.record.try_read().ok().and_then(|r| r.latency_ms) {
                Some(latency) => (total + latency, count + 1),
                None => (total, count),
            }
        });
        if count == 0 {
            0.0
        } else {
            total as f64 / count as f64
        }
    }

    /// Attempt to connect to a peer. If already known and in a sending
    /// state, this is a no-op reporting success. Tries the direct address
    /// first; on failure iterates `config.relay_servers`, waiting for the
    /// relay's `connected` acknowledgment before considering it open.
    pub async fn connect_to_peer(
        &self,
        peer_id: &str,
        peer_public_key: [u8; 32],
        direct_address: TransportAddress,
    ) -> Result<bool> {
        if !crate::identity::validate_node_id(peer_id) {
            return Err(Error::InvalidId(peer_id.to_string()));
        }
        let peer_id: NodeId = peer_id.parse()?;

        if let Some(entry) = self.peers.get(&peer_id) {
            let state = entry.record.read().await.state.clone();
            if matches!(state, PeerState::Connected | PeerState::Relaying) {
                return Ok(true);
            }
        }

        self.evict_if_over_capacity().await;

        if let Ok(transport) = self.try_open(&direct_address).await {
            self.insert_peer(peer_id.clone(), peer_public_key, direct_address, transport.clone())
                .await;
            self.set_state(&peer_id, PeerState::Connected).await;
            self.spawn_receive_loop(peer_id.clone(), transport);
            let _ = self.events_tx.send(ConnectionEvent::Connected { peer: peer_id });
            return Ok(true);
        }

        for relay in &self.config.relay_servers {
            let relay_addr = TransportAddress::Relay {
                relay: relay.clone(),
                peer: peer_id.to_string(),
            };
            if let Ok(transport) = self.try_open(&relay_addr).await {
                // Wait for the relay's explicit `connected` acknowledgment
                // rather than assuming success optimistically.
                let ack = tokio::time::timeout(
                    Duration::from_millis(self.config.timeout_ms),
                    wait_for_connected(&transport),
                )
                .await;
                if matches!(ack, Ok(true)) {
                    self.insert_peer(peer_id.clone(), peer_public_key, relay_addr, transport.clone())
                        .await;
                    self.set_state(&peer_id, PeerState::Relaying).await;
                    self.spawn_receive_loop(peer_id.clone(), transport);
                    let _ = self
                        .events_tx
                        .send(ConnectionEvent::Connected { peer: peer_id });
                    return Ok(true);
                }
            }
        }

        let _ = self.events_tx.send(ConnectionEvent::Disconnected {
            peer: peer_id,
            reason: "neither direct nor relay transport succeeded".to_string(),
        });
        Ok(false)
    }

    /// Register a peer discovered via an incoming connection rather than an
    /// outbound `connect_to_peer` call — e.g. a TCP listener accepting a
    /// socket and learning the remote's node id and public key from its
    /// opening `Hello`. Mirrors `connect_to_peer`'s bookkeeping without
    /// dialing anything.
    pub async fn register_inbound_peer(
        &self,
        peer_id: NodeId,
        peer_public_key: [u8; 32],
        address: TransportAddress,
        transport: Arc<dyn Transport>,
    ) {
        self.evict_if_over_capacity().await;
        self.insert_peer(peer_id.clone(), peer_public_key, address, transport.clone())
            .await;
        self.set_state(&peer_id, PeerState::Connected).await;
        self.spawn_receive_loop(peer_id.clone(), transport);
        let _ = self.events_tx.send(ConnectionEvent::Connected { peer: peer_id });
    }

    async fn try_open(&self, address: &TransportAddress) -> Result<Arc<dyn Transport>> {
        let transport = self.factory.open(address).await?;
        transport.connect().await?;
        Ok(transport)
    }

    async fn insert_peer(
        &self,
        node_id: NodeId,
        public_key: [u8; 32],
        address: TransportAddress,
        transport: Arc<dyn Transport>,
    ) {
        let record = PeerRecord {
            node_id: node_id.clone(),
            state: PeerState::Connecting,
            address,
            public_key,
            last_seen_ms: now_ms(),
            last_ping_ms: None,
            latency_ms: None,
            quality: Quality::default(),
            supported_kinds: HashSet::new(),
        };
        self.peers.insert(
            node_id,
            PeerEntry {
                record: RwLock::new(record),
                transport,
            },
        );
    }

    async fn set_state(&self, peer_id: &NodeId, state: PeerState) {
        if let Some(entry) = self.peers.get(peer_id) {
            let mut record = entry.record.write().await;
            record.state = state;
            record.last_seen_ms = now_ms();
        }
    }

    /// Evict the peer with the smallest `last_seen_ms` to make room under
    /// `max_peers`.
    async fn evict_if_over_capacity(&self) {
        if self.peers.len() < self.max_peers {
            return;
        }
        let mut oldest: Option<(NodeId, u64)> = None;
        for entry in self.peers.iter() {
            let last_seen = entry.record.read().await.last_seen_ms;
            if oldest.as_ref().map(|(_, t)| last_seen < *t).unwrap_or(true) {
                oldest = Some((entry.key().clone(), last_seen));
            }
        }
        if let Some((victim, _)) = oldest {
            tracing::debug!(peer = %victim, "evicting peer to make room under max_connections");
            let _ = self.disconnect(&victim).await;
        }
    }

    /// Encrypt and send `message` to `peer_id`. Requires a sending state.
    pub async fn send(&self, peer_id: &NodeId, message: &Message) -> Result<bool> {
        let Some(entry) = self.peers.get(peer_id) else {
            return Ok(false);
        };
        let (state, public_key, address) = {
            let record = entry.record.read().await;
            (record.state.clone(), record.public_key, record.address.clone())
        };
        if !matches!(state, PeerState::Connected | PeerState::Relaying) {
            return Ok(false);
        }

        // Only the application-level payload is encrypted; the rest of the
        // record's header fields stay in cleartext JSON so a relay (or a
        // future peer) can route, dedup, and TTL-check without decrypting.
        let mut wire_message = message.clone();
        wire_message.payload = self.keys.encrypt(&public_key, &message.payload)?;
        let wire_json = protocol::serialize(&wire_message)?;

        let bytes = match &address {
            TransportAddress::Direct(_) => wire_json.into_bytes(),
            TransportAddress::Relay { .. } => {
                let envelope = serde_json::json!({
                    "type": "message",
                    "from": self.local_node_id.to_string(),
                    "to": peer_id.to_string(),
                    "payload": wire_json,
                });
                serde_json::to_vec(&envelope)?
            }
        };

        entry.transport.send(&bytes).await?;
        Ok(true)
    }

    /// Send `message` to every peer currently in a sending state.
    pub async fn broadcast_to_peers(&self, message: &Message) -> usize {
        let mut count = 0;
        let ids: Vec<NodeId> = self.peers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Ok(true) = self.send(&id, message).await {
                count += 1;
            }
        }
        count
    }

    /// Close the transport (best-effort), emit `disconnected`, drop the
    /// peer record.
    pub async fn disconnect(&self, peer_id: &NodeId) -> Result<()> {
        if let Some((_, entry)) = self.peers.remove(peer_id) {
            let _ = entry.transport.disconnect().await;
            let _ = self.events_tx.send(ConnectionEvent::Disconnected {
                peer: peer_id.clone(),
                reason: "disconnect requested".to_string(),
            });
        }
        Ok(())
    }

    /// Cancel all heartbeats, close all transports, clear all state.
    pub async fn shutdown(&self) {
        let ids: Vec<NodeId> = self.peers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let _ = self.disconnect(&id).await;
        }
    }

    /// Send a Ping to every `Connected` peer. Call on a `heartbeat_interval`
    /// tick from the owner.
    pub async fn heartbeat_tick(&self) {
        let ids: Vec<NodeId> = self
            .peers
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            let is_connected = self
                .peers
                .get(&id)
                .map(|e| matches!(e.record.try_read().map(|r| r.state.clone()), Ok(PeerState::Connected)))
                .unwrap_or(false);
            if !is_connected {
                continue;
            }
            let ping = match protocol::construct(
                self.local_node_id.clone(),
                String::new(),
                Body::Ping,
                ConstructOptions {
                    ttl_ms: Some(10_000),
                    ..Default::default()
                },
            ) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to construct heartbeat ping");
                    continue;
                }
            };
            if let Some(entry) = self.peers.get(&id) {
                entry.record.write().await.last_ping_ms = Some(now_ms());
            }
            match self.send(&id, &ping).await {
                Ok(true) => {}
                _ => {
                    tracing::warn!(peer = %id, "heartbeat failed");
                    self.set_state(&id, PeerState::Error("Heartbeat failed".into()))
                        .await;
                    let _ = self.disconnect(&id).await;
                }
            }
        }
    }

    /// If `connection.enable_obfuscation` is set, send a randomly-padded
    /// chaff message (kind `Hello`, which carries no handled semantics of
    /// its own) to every connected peer so an observer watching encrypted
    /// traffic sizes and timing can't distinguish real activity from noise.
    /// No-op entirely when the layer is disabled.
    pub async fn obfuscation_tick(&self) {
        if !self.config.enable_obfuscation {
            return;
        }
        let ids: Vec<NodeId> = self
            .peers
            .iter()
            .filter(|e| matches!(e.record.try_read().map(|r| r.state.clone()), Ok(PeerState::Connected) | Ok(PeerState::Relaying)))
            .map(|e| e.key().clone())
            .collect();

        for id in ids {
            let pad_len: usize = rand::Rng::gen_range(&mut rand::thread_rng(), 16usize..256usize);
            let mut padding = vec![0u8; pad_len];
            rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut padding);
            let chaff = match protocol::construct(
                self.local_node_id.clone(),
                hex::encode(padding),
                Body::Hello,
                ConstructOptions {
                    ttl_ms: Some(10_000),
                    ..Default::default()
                },
            ) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to construct obfuscation chaff");
                    continue;
                }
            };
            let _ = self.send(&id, &chaff).await;
        }
    }

    fn spawn_receive_loop(&self, peer_id: NodeId, transport: Arc<dyn Transport>) {
        let keys = self.keys.clone();
        let events_tx = self.events_tx.clone();
        let peers = self.peers.clone();
        let local_node_id = self.local_node_id.clone();

        tokio::spawn(async move {
            loop {
                let Some(event) = transport.next_event().await else {
                    break;
                };
                match event {
                    TransportEvent::DataReceived(bytes) => {
                        if let Err(e) = handle_incoming(
                            &peer_id,
                            &bytes,
                            &keys,
                            &peers,
                            &events_tx,
                            &local_node_id,
                        )
                        .await
                        {
                            let _ = events_tx.send(ConnectionEvent::Error {
                                peer: Some(peer_id.clone()),
                                error: e.to_string(),
                            });
                        }
                    }
                    TransportEvent::Disconnected { reason } => {
                        peers.remove(&peer_id);
                        let _ = events_tx.send(ConnectionEvent::Disconnected {
                            peer: peer_id.clone(),
                            reason,
                        });
                        break;
                    }
                    TransportEvent::Error(reason) => {
                        let _ = events_tx.send(ConnectionEvent::Error {
                            peer: Some(peer_id.clone()),
                            error: reason,
                        });
                    }
                    TransportEvent::Connected => {}
                }
            }
        });
    }
}

async fn handle_incoming(
    peer_id: &NodeId,
    bytes: &[u8],
    keys: &EnvelopeKeys,
    peers: &DashMap<NodeId, PeerEntry>,
    events_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    local_node_id: &NodeId,
) -> Result<()> {
    let Some(entry) = peers.get(peer_id) else {
        return Ok(());
    };
    let public_key = entry.record.read().await.public_key;
    let address = entry.record.read().await.address.clone();

    // The wire bytes carry a Message whose header fields are already
    // cleartext JSON; only its `payload` field is ciphertext, mirroring the
    // encrypt-in-place done by `send`.
    let wire_json = match &address {
        TransportAddress::Direct(_) => String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::DecryptionFailed(format!("non-utf8 frame: {e}")))?,
        TransportAddress::Relay { .. } => {
            let envelope: serde_json::Value = serde_json::from_slice(bytes)?;
            envelope
                .get("payload")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::DecryptionFailed("relay envelope missing payload".into()))?
                .to_string()
        }
    };

    let mut message = protocol::deserialize(&wire_json)?;
    message.payload = keys.decrypt(&public_key, &message.payload)?;

    entry.record.write().await.last_seen_ms = now_ms();

    if matches!(message.body, Body::Pong) {
        if let Some(last_ping) = entry.record.read().await.last_ping_ms {
            let latency = now_ms().saturating_sub(last_ping);
            let mut record = entry.record.write().await;
            record.latency_ms = Some(latency);
            record.quality.latency_ms = latency;
        }
    } else if matches!(message.body, Body::Ping) {
        let pong = protocol::construct(
            local_node_id.clone(),
            String::new(),
            Body::Pong,
            ConstructOptions::default(),
        )?;
        let mut wire_pong = pong;
        wire_pong.payload = keys.encrypt(&public_key, &wire_pong.payload)?;
        let wire_json = protocol::serialize(&wire_pong)?;
        let out_bytes = match &address {
            TransportAddress::Direct(_) => wire_json.into_bytes(),
            TransportAddress::Relay { .. } => serde_json::to_vec(&serde_json::json!({
                "type": "message",
                "from": local_node_id.to_string(),
                "to": peer_id.to_string(),
                "payload": wire_json,
            }))?,
        };
        entry.transport.send(&out_bytes).await?;
    }

    let _ = events_tx.send(ConnectionEvent::Message {
        message,
        peer: peer_id.clone(),
    });
    Ok(())
}

async fn wait_for_connected(transport: &Arc<dyn Transport>) -> bool {
    matches!(transport.next_event().await, Some(TransportEvent::Connected))
}
