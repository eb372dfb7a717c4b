use crate::{
    cluster::Node,
    config::TransportConfig,
    job::JobOutcome,
    transport::{CommandOutput, Transport, TransportError},
};
use itertools::Itertools;
use once_cell::sync::Lazy;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuilder};
use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

/// Output fragments that mean the runtime lost a peer, not that the job itself is broken
pub static DEFAULT_TRANSIENT_SIGNATURES: Lazy<Vec<String>> = Lazy::new(|| {
    [
        "ORTE has lost communication with a remote daemon",
        "PRTE has lost communication with a remote daemon",
        "closed by remote host",
        "Connection reset by peer",
        "lost connection",
        "Broken pipe",
    ]
    .into_iter()
    .map(String::from)
    .collect()
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Failed to build a worker pool of {size} threads: {reason}")]
    Pool { size: usize, reason: String },
    #[error("`{command}` did not succeed on {}", describe_failures(.failed))]
    Escalated {
        command: String,
        failed: Vec<(Node, JobOutcome)>,
    },
}

pub type OutcomeMap = BTreeMap<Node, JobOutcome>;

fn describe_failures(failed: &[(Node, JobOutcome)]) -> String {
    failed
        .iter()
        .map(|(node, outcome)| format!("{} ({outcome})", node.address))
        .join(", ")
}

/// Decide what a finished remote call means for the job
///
/// A transient signature wins over the exit status, so an MPI launcher that exits cleanly
/// after losing a daemon still counts as an eviction.
pub fn classify(
    result: &Result<CommandOutput, TransportError>,
    signatures: &[String],
) -> JobOutcome {
    match result {
        Ok(output) => {
            if let Some(signature) = signatures.iter().find(|signature| {
                output.stderr.contains(signature.as_str())
                    || output.stdout.contains(signature.as_str())
            }) {
                debug!(signature, "Matched transient infrastructure signature");

                JobOutcome::NodeEvicted
            } else if output.success() {
                JobOutcome::Success
            } else {
                JobOutcome::RemoteFault
            }
        }
        Err(TransportError::Timeout(_)) | Err(TransportError::Connection { .. }) => {
            JobOutcome::NodeEvicted
        }
        Err(TransportError::Spawn(_)) | Err(TransportError::Io(_)) => JobOutcome::RemoteFault,
    }
}

pub(crate) fn fan_out_pool(size: usize) -> Result<ThreadPool, ExecutorError> {
    ThreadPoolBuilder::new()
        .num_threads(size.max(1))
        .thread_name(|index| format!("fan-out-{index}"))
        .build()
        .map_err(|error| ExecutorError::Pool {
            size,
            reason: error.to_string(),
        })
}

/// Runs commands on nodes and classifies the outcome
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    signatures: Vec<String>,
    timeout: Option<Duration>,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            signatures: DEFAULT_TRANSIENT_SIGNATURES.clone(),
            timeout: None,
        }
    }

    pub fn load(transport: Arc<dyn Transport>, config: &TransportConfig) -> Self {
        Self {
            transport,
            signatures: config.transient_signatures.clone(),
            timeout: config.command_timeout.map(Duration::from_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn run(&self, node: &Node, command: &str) -> JobOutcome {
        let result = self.transport.execute(node, command, self.timeout);

        match &result {
            Ok(output) => {
                trace!(node = %node.address, stdout = %output.stdout, "Command output");
                if !output.stderr.trim().is_empty() {
                    debug!(node = %node.address, stderr = %output.stderr.trim(), "Command stderr");
                }
            }
            Err(error) => warn!(node = %node.address, error = %error, "Transport failed"),
        }

        let outcome = classify(&result, &self.signatures);
        info!(node = %node.address, command, outcome = %outcome, "Classified remote command");

        outcome
    }

    /// copy a local tree to `node`, classified like a remote command
    pub fn upload(&self, local: &Path, node: &Node, remote: &str) -> JobOutcome {
        let result = self
            .transport
            .upload_tree(local, node, remote)
            .map(|_| CommandOutput::default());
        if let Err(error) = &result {
            warn!(node = %node.address, local = ?local, remote, error = %error, "Upload failed");
        }

        classify(&result, &[])
    }

    pub fn download(&self, node: &Node, remote: &str, local: &Path) -> JobOutcome {
        let result = self
            .transport
            .download_tree(node, remote, local)
            .map(|_| CommandOutput::default());
        if let Err(error) = &result {
            warn!(node = %node.address, remote, local = ?local, error = %error, "Download failed");
        }

        classify(&result, &[])
    }

    /// run `command` on every node concurrently and wait for all of them
    ///
    /// With `escalate` set, any non successful node turns into an `Escalated` error once every
    /// worker has returned.
    #[instrument(skip(self, nodes), fields(nodes = nodes.len()), level = "debug")]
    pub fn run_on_many(
        &self,
        nodes: &[Node],
        command: &str,
        escalate: bool,
    ) -> Result<OutcomeMap, ExecutorError> {
        if nodes.is_empty() {
            return Ok(OutcomeMap::new());
        }

        let outcomes = fan_out_pool(nodes.len())?.install(|| {
            nodes
                .par_iter()
                .map(|node| (node.clone(), self.run(node, command)))
                .collect::<OutcomeMap>()
        });

        let failed = outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(node, outcome)| (node.clone(), *outcome))
            .collect_vec();

        if escalate && !failed.is_empty() {
            return Err(ExecutorError::Escalated {
                command: command.to_owned(),
                failed,
            });
        }

        Ok(outcomes)
    }
}
