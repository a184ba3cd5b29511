//! driftnet - an encrypted, intent-addressed peer-to-peer overlay for
//! transient nodes.
//!
//! Nodes have no persistent identity: each session generates a fresh
//! [`identity::KeyPair`] and ephemeral [`identity::NodeId`]. Messages travel
//! as point-to-point whispers, epidemic broadcasts, or topic-scoped
//! resonance advertisements, all carried by the same [`protocol::Message`]
//! envelope over a [`transport::Transport`] managed by
//! [`connection::ConnectionManager`] and orchestrated by
//! [`gossip::Orchestrator`].

pub mod config;
pub mod connection;
pub mod error;
pub mod extension;
pub mod gossip;
pub mod identity;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};
pub use gossip::Orchestrator;
