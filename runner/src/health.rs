use crate::{
    cluster::{Cluster, Node},
    executors::{fan_out_pool, ExecutorError},
    transport::Transport,
};
use rayon::prelude::*;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{info, instrument, warn};

pub type ProbeMap = BTreeMap<Node, bool>;

/// Verdict over a whole node set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub probes: ProbeMap,
    /// unhealthy nodes in node-list order
    pub unhealthy: Vec<Node>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.unhealthy.is_empty()
    }

    pub fn first_unhealthy(&self) -> Option<&Node> {
        self.unhealthy.first()
    }
}

/// Fans a liveness probe out over every node of a cluster
///
/// Every node is always probed to completion, there is no short circuit on the first failure.
#[derive(Debug, Clone)]
pub struct HealthProber {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl HealthProber {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn probe(&self, nodes: &[Node], timeout: Duration) -> Result<ProbeMap, ExecutorError> {
        if nodes.is_empty() {
            return Ok(ProbeMap::new());
        }

        Ok(fan_out_pool(nodes.len())?.install(|| {
            nodes
                .par_iter()
                .map(|node| (node.clone(), self.transport.probe(node, timeout)))
                .collect()
        }))
    }

    #[instrument(skip(self, cluster), fields(cluster = %cluster.tag), level = "debug")]
    pub fn check(&self, cluster: &Cluster) -> Result<HealthReport, ExecutorError> {
        let nodes = cluster.nodes();
        let probes = self.probe(&nodes, self.timeout)?;
        let unhealthy = nodes
            .iter()
            .filter(|node| !probes.get(*node).copied().unwrap_or(false))
            .cloned()
            .collect::<Vec<_>>();

        let report = HealthReport { probes, unhealthy };

        match report.first_unhealthy() {
            Some(node) => warn!(
                cluster = %cluster.tag,
                node = %node.address,
                unhealthy = report.unhealthy.len(),
                "Cluster is NOT healthy"
            ),
            None => info!(cluster = %cluster.tag, nodes = nodes.len(), "Cluster is healthy"),
        }

        Ok(report)
    }

    /// a cluster whose fan-out can't even be started counts as unhealthy
    pub fn is_healthy(&self, cluster: &Cluster) -> bool {
        match self.check(cluster) {
            Ok(report) => report.is_healthy(),
            Err(error) => {
                warn!(error = %error, "Failed to probe cluster");

                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;

    fn cluster(addresses: &[&str]) -> Cluster {
        Cluster::new(
            "c",
            FakeTransport::USER,
            &addresses.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
        )
    }

    #[test]
    fn one_dead_node_makes_the_cluster_unhealthy() {
        let transport = FakeTransport::new();
        transport.kill("C");
        let prober = HealthProber::new(Arc::new(transport.clone()), Duration::from_secs(1));

        let report = prober.check(&cluster(&["A", "B", "C", "D"])).unwrap();

        assert!(!report.is_healthy());
        assert_eq!(report.unhealthy.len(), 1);
        assert_eq!(report.first_unhealthy().unwrap().address, "C");
        // no short circuit
        assert_eq!(report.probes.len(), 4);
        assert_eq!(transport.probe_count(), 4);
    }

    #[test]
    fn all_alive_is_healthy() {
        let transport = FakeTransport::new();
        let prober = HealthProber::new(Arc::new(transport), Duration::from_secs(1));

        assert!(prober.is_healthy(&cluster(&["A", "B"])));
    }

    #[test]
    fn several_dead_nodes_are_reported_in_order() {
        let transport = FakeTransport::new();
        transport.kill("C");
        transport.kill("A");
        let prober = HealthProber::new(Arc::new(transport), Duration::from_secs(1));

        let report = prober.check(&cluster(&["A", "B", "C"])).unwrap();
        let addresses = report
            .unhealthy
            .iter()
            .map(|node| node.address.as_str())
            .collect::<Vec<_>>();

        assert_eq!(addresses, vec!["A", "C"]);
    }
}
