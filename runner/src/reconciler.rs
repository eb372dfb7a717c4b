use crate::{
    cluster::{node_delta, Cluster, Node, SharedStorage},
    config::ReconcilerConfig,
    database::{Store, StoreError},
    executors::{ExecutorError, RemoteExecutor},
    health::HealthProber,
    provision::{is_stable, LiveNode, ProvisionError, Provisioner},
    sync::{CancellationToken, Poll, PollError, Poller},
};
use itertools::Itertools;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Reconciliation was cancelled or ran past its deadline")]
    Cancelled,
    #[error("Failed to probe the cluster")]
    Probe(#[source] ExecutorError),
    #[error("Provisioning failed")]
    Provisioning(#[from] ProvisionError),
    #[error("Cluster still degraded after {rounds} rounds, unhealthy: {}", .unhealthy.join(", "))]
    StillDegraded { rounds: u32, unhealthy: Vec<String> },
    #[error("Shared storage could not be attached on {} after {attempts} attempts", .nodes.join(", "))]
    StorageAttach { nodes: Vec<String>, attempts: u32 },
    #[error("Bootstrap of replaced nodes failed")]
    Bootstrap(#[source] ExecutorError),
    #[error("Failed to persist the reconciled cluster")]
    Store(#[from] StoreError),
}

impl From<PollError<ProvisionError>> for ReconcileError {
    fn from(error: PollError<ProvisionError>) -> Self {
        match error {
            PollError::Step(error) => Self::Provisioning(error),
            PollError::Cancelled | PollError::Exhausted(_) => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub mount_attempts: u32,
    pub mount_retry_delay: Duration,
    pub max_rounds: u32,
    pub timeout: Option<Duration>,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            settle_delay: Duration::from_secs(15),
            mount_attempts: 10,
            mount_retry_delay: Duration::from_secs(5),
            max_rounds: 3,
            timeout: None,
        }
    }
}

impl From<&ReconcilerConfig> for ReconcilerSettings {
    fn from(config: &ReconcilerConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval),
            settle_delay: Duration::from_secs(config.settle_delay),
            mount_attempts: config.mount_attempts,
            mount_retry_delay: Duration::from_secs(config.mount_retry_delay),
            max_rounds: config.max_rounds,
            timeout: config.timeout.map(Duration::from_secs),
        }
    }
}

/// What a reconciliation did to the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// number of converge passes, zero if the cluster was healthy
    pub rounds: u32,
    /// nodes that were not part of the cluster before
    pub replaced: Vec<Node>,
}

impl ReconcileReport {
    pub fn repaired(&self) -> bool {
        self.rounds > 0
    }

    pub fn control_node_replaced(&self, cluster: &Cluster) -> bool {
        cluster
            .control_node()
            .map(|control| self.replaced.contains(&control))
            .unwrap_or(false)
    }
}

/// Restores a degraded cluster to full strength and re-bootstraps only the replaced nodes
#[derive(Debug, Clone)]
pub struct Reconciler {
    prober: HealthProber,
    executor: RemoteExecutor,
    provisioner: Arc<dyn Provisioner>,
    store: Arc<dyn Store>,
    settings: ReconcilerSettings,
    token: CancellationToken,
}

impl Reconciler {
    pub fn new(
        prober: HealthProber,
        executor: RemoteExecutor,
        provisioner: Arc<dyn Provisioner>,
        store: Arc<dyn Store>,
        settings: ReconcilerSettings,
        token: CancellationToken,
    ) -> Self {
        Self {
            prober,
            executor,
            provisioner,
            store,
            settings,
            token,
        }
    }

    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    fn expired(&self, deadline: Option<Instant>) -> bool {
        self.token.is_cancelled()
            || deadline
                .map(|deadline| Instant::now() >= deadline)
                .unwrap_or(false)
    }

    #[instrument(skip(self, cluster), fields(cluster = %cluster.tag), level = "info")]
    pub fn reconcile(&self, cluster: &Cluster) -> Result<ReconcileReport, ReconcileError> {
        let deadline = self.settings.timeout.map(|timeout| Instant::now() + timeout);
        let original = cluster.nodes();
        let mut report = ReconcileReport::default();

        loop {
            if self.expired(deadline) {
                return Err(ReconcileError::Cancelled);
            }

            let health = self.prober.check(cluster).map_err(ReconcileError::Probe)?;
            if health.is_healthy() {
                report.replaced = node_delta(&original, &cluster.nodes());
                if report.repaired() {
                    info!(
                        rounds = report.rounds,
                        replaced = report.replaced.len(),
                        "Cluster restored"
                    );
                }

                return Ok(report);
            }

            if report.rounds >= self.settings.max_rounds {
                let unhealthy = health
                    .unhealthy
                    .iter()
                    .map(|node| node.address.clone())
                    .collect_vec();
                error!(rounds = report.rounds, unhealthy = ?unhealthy, "Giving up on cluster");

                return Err(ReconcileError::StillDegraded {
                    rounds: report.rounds,
                    unhealthy,
                });
            }
            report.rounds += 1;

            info!(round = report.rounds, unhealthy = health.unhealthy.len(), "Repairing cluster");
            self.provisioner.converge()?;

            let live = self.await_stable(cluster.node_count, deadline)?;
            let delta = cluster.replace_nodes(
                live.into_iter()
                    .map(|node| Node::new(node.address, cluster.username.clone()))
                    .collect(),
            );
            info!(
                replaced = ?delta.iter().map(|node| node.address.as_str()).collect_vec(),
                "Node list converged"
            );

            if !delta.is_empty() {
                if !self.token.sleep(self.settings.settle_delay) {
                    return Err(ReconcileError::Cancelled);
                }

                if let Some(storage) = &cluster.shared_storage {
                    self.attach_storage(&delta, storage, deadline)?;
                }
                self.bootstrap(&delta, &cluster.bootstrap_commands)?;
            }

            self.store.save_cluster(&cluster.to_record())?;
        }
    }

    /// wait until the provisioner reports the desired number of running nodes
    fn await_stable(
        &self,
        desired_count: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<LiveNode>, ReconcileError> {
        let poller = Poller::new(self.token.clone(), self.settings.poll_interval)
            .with_deadline(deadline);

        let nodes = poller.run(|attempt| {
            let nodes = self.provisioner.list_live_nodes(desired_count)?;

            if is_stable(&nodes, desired_count) {
                Ok(Poll::Ready(nodes))
            } else {
                debug!(
                    attempt,
                    listed = nodes.len(),
                    desired = desired_count,
                    "Waiting for node set to stabilize"
                );

                Ok(Poll::Pending)
            }
        })?;

        Ok(nodes)
    }

    /// mount commands are retried per node, the storage endpoint may not resolve right away
    fn attach_storage(
        &self,
        nodes: &[Node],
        storage: &SharedStorage,
        deadline: Option<Instant>,
    ) -> Result<(), ReconcileError> {
        let attempts = self.settings.mount_attempts.max(1);

        for command in storage.mount_commands.iter() {
            let mut pending = nodes.to_vec();
            let poller = Poller::new(self.token.clone(), self.settings.mount_retry_delay)
                .with_deadline(deadline)
                .with_max_attempts(attempts);

            let result = poller.run(|attempt| {
                let outcomes = self.executor.run_on_many(&pending, command, false)?;
                pending.retain(|node| {
                    !outcomes
                        .get(node)
                        .map(|outcome| outcome.is_success())
                        .unwrap_or(false)
                });

                if pending.is_empty() {
                    Ok(Poll::Ready(()))
                } else {
                    warn!(attempt, remaining = pending.len(), command = %command, "Mount attempt failed");

                    Ok(Poll::Pending)
                }
            });

            match result {
                Ok(()) => info!(command = %command, nodes = nodes.len(), "Shared storage attached"),
                Err(PollError::Step(error)) => return Err(ReconcileError::Bootstrap(error)),
                Err(PollError::Cancelled) => return Err(ReconcileError::Cancelled),
                Err(PollError::Exhausted(attempts)) => {
                    return Err(ReconcileError::StorageAttach {
                        nodes: pending.iter().map(|node| node.address.clone()).collect(),
                        attempts,
                    })
                }
            }
        }

        Ok(())
    }

    fn bootstrap(&self, nodes: &[Node], commands: &[String]) -> Result<(), ReconcileError> {
        for command in commands.iter() {
            self.executor
                .run_on_many(nodes, command, true)
                .map_err(ReconcileError::Bootstrap)?;
        }

        info!(nodes = nodes.len(), commands = commands.len(), "Bootstrapped replaced nodes");

        Ok(())
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
