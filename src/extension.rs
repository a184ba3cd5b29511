//! Extension registration/dispatch contract.
//!
//! Extensions are external collaborators routed by the same fabric as the
//! built-in message kinds; the orchestrator only specifies how they
//! register and receive messages, never what they do with them.

use async_trait::async_trait;

use crate::error::Result;
use crate::identity::NodeId;
use crate::protocol::{Message, MessageKind};

/// A higher-level subsystem registered to receive messages of specific
/// kinds. Errors from `handle_message` are caught and logged by the
/// orchestrator; they never kill the pipeline.
#[async_trait]
pub trait Extension: Send + Sync {
    fn identifier(&self) -> &str;
    fn version(&self) -> &str;
    fn supported_kinds(&self) -> &[MessageKind];

    /// Called once at orchestrator start, or immediately at registration
    /// time if registered after start.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn handle_message(&self, message: &Message, peer: &NodeId) -> Result<()>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}
