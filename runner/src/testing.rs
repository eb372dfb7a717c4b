//! Scripted collaborators for unit tests

use crate::{
    cluster::Node,
    provision::{LiveNode, ProvisionError, Provisioner},
    transport::{CommandOutput, Transport, TransportError},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

#[derive(Debug, Default)]
struct TransportState {
    dead: BTreeSet<String>,
    // (address, command) -> (status, stderr)
    failures: BTreeMap<(String, String), (i32, String)>,
    // command -> outputs handed out one per call, on any node
    scripted: BTreeMap<String, VecDeque<CommandOutput>>,
    // (address, command) pairs that take the node down when run
    crashes: BTreeSet<(String, String)>,
    calls: Vec<(String, String)>,
    probes: usize,
    uploads: Vec<(PathBuf, String, String)>,
    downloads: Vec<(String, String, PathBuf)>,
}

/// In-memory transport, every node not killed answers every command with success
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub const USER: &'static str = "tester";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self, addresses: &[&str]) -> Vec<Node> {
        addresses
            .iter()
            .map(|address| Node::new(*address, Self::USER))
            .collect()
    }

    pub fn kill(&self, address: &str) {
        self.state.lock().dead.insert(address.to_owned());
    }

    pub fn fail_on(&self, address: &str, command: &str, status: i32, stderr: &str) {
        self.state.lock().failures.insert(
            (address.to_owned(), command.to_owned()),
            (status, stderr.to_owned()),
        );
    }

    /// `address` dies the first time it runs `command`, the call itself loses the connection
    pub fn crash_on(&self, address: &str, command: &str) {
        self.state
            .lock()
            .crashes
            .insert((address.to_owned(), command.to_owned()));
    }

    /// queue outputs for `command`, once drained the command succeeds again
    pub fn script(&self, command: &str, outputs: Vec<(i32, &str)>) {
        self.state.lock().scripted.insert(
            command.to_owned(),
            outputs
                .into_iter()
                .map(|(status, stderr)| CommandOutput {
                    status,
                    stdout: String::new(),
                    stderr: stderr.to_owned(),
                })
                .collect(),
        );
    }

    /// make `command` report a lost MPI daemon on every call
    pub fn always_evict(&self, command: &str) {
        self.script(
            command,
            vec![(1, "ORTE has lost communication with a remote daemon."); 64],
        );
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.state.lock().calls.clone()
    }

    /// addresses `command` was run on, in call order
    pub fn calls_for(&self, command: &str) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(_, called)| called == command)
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub fn probe_count(&self) -> usize {
        self.state.lock().probes
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String, String)> {
        self.state.lock().uploads.clone()
    }

    pub fn downloads(&self) -> Vec<(String, String, PathBuf)> {
        self.state.lock().downloads.clone()
    }

    fn unreachable(address: &str) -> TransportError {
        TransportError::Connection {
            address: address.to_owned(),
            reason: "No route to host".to_owned(),
        }
    }
}

impl Transport for FakeTransport {
    fn probe(&self, node: &Node, _timeout: Duration) -> bool {
        let mut state = self.state.lock();
        state.probes += 1;

        !state.dead.contains(&node.address)
    }

    fn execute(
        &self,
        node: &Node,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, TransportError> {
        let mut state = self.state.lock();
        state.calls.push((node.address.clone(), command.to_owned()));

        let key = (node.address.clone(), command.to_owned());
        if state.crashes.remove(&key) {
            state.dead.insert(node.address.clone());
        }
        if state.dead.contains(&node.address) {
            return Err(Self::unreachable(&node.address));
        }

        if let Some((status, stderr)) =
            state.failures.get(&key)
        {
            return Ok(CommandOutput {
                status: *status,
                stdout: String::new(),
                stderr: stderr.clone(),
            });
        }

        if let Some(output) = state
            .scripted
            .get_mut(command)
            .and_then(|queue| queue.pop_front())
        {
            return Ok(output);
        }

        Ok(CommandOutput::default())
    }

    fn upload_tree(&self, local: &Path, node: &Node, remote: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();

        if state.dead.contains(&node.address) {
            return Err(Self::unreachable(&node.address));
        }
        state
            .uploads
            .push((local.to_path_buf(), node.address.clone(), remote.to_owned()));

        Ok(())
    }

    fn download_tree(
        &self,
        node: &Node,
        remote: &str,
        local: &Path,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();

        if state.dead.contains(&node.address) {
            return Err(Self::unreachable(&node.address));
        }
        state
            .downloads
            .push((node.address.clone(), remote.to_owned(), local.to_path_buf()));

        Ok(())
    }
}

#[derive(Debug, Default)]
struct ProvisionerState {
    listings: VecDeque<Vec<LiveNode>>,
    converges: usize,
    polls: usize,
    fail_converge: bool,
}

/// Provisioner replaying a fixed sequence of node listings, the last one repeats forever
#[derive(Debug, Clone, Default)]
pub struct FakeProvisioner {
    state: Arc<Mutex<ProvisionerState>>,
}

impl FakeProvisioner {
    pub fn new(listings: Vec<Vec<LiveNode>>) -> Self {
        let provisioner = Self::default();
        provisioner.state.lock().listings = listings.into();

        provisioner
    }

    pub fn settled(addresses: &[&str]) -> Self {
        Self::new(vec![running(addresses)])
    }

    pub fn failing() -> Self {
        let provisioner = Self::default();
        provisioner.state.lock().fail_converge = true;

        provisioner
    }

    pub fn converge_count(&self) -> usize {
        self.state.lock().converges
    }

    pub fn poll_count(&self) -> usize {
        self.state.lock().polls
    }
}

pub fn running(addresses: &[&str]) -> Vec<LiveNode> {
    addresses
        .iter()
        .map(|address| LiveNode::running(*address))
        .collect()
}

impl Provisioner for FakeProvisioner {
    fn converge(&self) -> Result<(), ProvisionError> {
        let mut state = self.state.lock();
        state.converges += 1;

        if state.fail_converge {
            return Err(ProvisionError::Command {
                command: "terraform apply -auto-approve".to_owned(),
                status: 1,
                stderr: "Error: creating EC2 Instance: InsufficientInstanceCapacity".to_owned(),
            });
        }

        Ok(())
    }

    fn list_live_nodes(&self, _desired_count: usize) -> Result<Vec<LiveNode>, ProvisionError> {
        let mut state = self.state.lock();
        state.polls += 1;

        let listing = if state.listings.len() > 1 {
            state.listings.pop_front().unwrap_or_default()
        } else {
            state.listings.front().cloned().unwrap_or_default()
        };

        Ok(listing)
    }
}
