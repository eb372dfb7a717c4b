pub mod command;

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Provisioning command `{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("Failed to run provisioning command: {0}")]
    Transport(#[from] crate::transport::TransportError),
    #[error("Failed to parse the node listing")]
    Listing(#[from] serde_yaml::Error),
}

/// Lifecycle states reported by the infrastructure, anything but `Running` is transitional
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    Pending,
    #[default]
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LiveNode {
    pub address: String,
    #[serde(default)]
    pub state: NodeState,
}

impl LiveNode {
    pub fn running(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: NodeState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == NodeState::Running
    }
}

/// Infrastructure collaborator that can put the node pool back into its declared shape
pub trait Provisioner: Send + Sync + Debug {
    /// converge the infrastructure to its desired state, may be slow and is idempotent
    fn converge(&self) -> Result<(), ProvisionError>;

    /// best effort snapshot of the nodes that currently exist
    fn list_live_nodes(&self, desired_count: usize) -> Result<Vec<LiveNode>, ProvisionError>;
}

/// the listing is usable once it has the desired size and nothing is still transitioning
pub fn is_stable(nodes: &[LiveNode], desired_count: usize) -> bool {
    nodes.len() == desired_count && nodes.iter().all(LiveNode::is_running)
}
