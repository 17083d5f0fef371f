// Isolated execution contexts — opaque to the rest of the crate, speaking
// only ordered text lines over an exclusively owned channel pair.

pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Channel pair for one instantiated context. The command sender and line
/// receiver are exclusively owned by the engine instance that created them.
pub struct EngineHandle {
    /// Outbound command lines (without trailing newline).
    pub commands: mpsc::UnboundedSender<String>,
    /// Inbound output lines, delivered in emission order.
    pub lines: mpsc::UnboundedReceiver<String>,
}

/// Instantiates an isolated execution context from a binary blob.
#[async_trait]
pub trait EngineRuntime: Send + Sync {
    async fn instantiate(&self, binary: Bytes) -> Result<EngineHandle>;
}
