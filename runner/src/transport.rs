pub mod ssh;

use crate::cluster::Node;
use std::{fmt::Debug, path::Path, time::Duration};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Connection to {address} failed: {reason}")]
    Connection { address: String, reason: String },
    #[error("Failed to spawn transport process: {0}")]
    Spawn(String),
    #[error("Transport I/O failed: {0}")]
    Io(String),
}

/// container for what a remote command left behind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Mechanism that reaches a node: liveness probing, command execution and tree transfers
///
/// Implementations are shared across fan-out worker threads.
pub trait Transport: Send + Sync + Debug {
    /// cheap liveness check, any failure maps to `false`
    fn probe(&self, node: &Node, timeout: Duration) -> bool;

    fn execute(
        &self,
        node: &Node,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, TransportError>;

    fn upload_tree(&self, local: &Path, node: &Node, remote: &str) -> Result<(), TransportError>;

    fn download_tree(&self, node: &Node, remote: &str, local: &Path)
        -> Result<(), TransportError>;
}
