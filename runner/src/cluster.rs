use crate::database::{Store, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, ops::Deref, sync::Arc, time::Duration};
use tracing::{debug, info};

/// A compute node, identified by an opaque address
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(deny_unknown_fields)]
pub struct Node {
    pub address: String,
    // login the transport authenticates with, e.g. the ssh user
    pub credentials: String,
}

impl Node {
    pub fn new(address: impl Into<String>, credentials: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            credentials: credentials.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.credentials, self.address)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SharedStorage {
    pub mount_commands: Vec<String>,
}

/// Persisted, plain form of a `Cluster`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ClusterRecord {
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub is_online: bool,
    pub node_count: usize,
    pub username: String,
    pub slots_per_node: u32,
    pub nodes: Vec<Node>,
    pub shared_storage: Option<SharedStorage>,
    pub bootstrap_commands: Vec<String>,
    pub time_spent_provisioning: Duration,
}

/// Long lived cluster aggregate
///
/// The node list is only ever replaced as a whole. Readers take a snapshot (`nodes`) which stays
/// consistent even if the reconciler publishes a new list right after.
#[derive(Debug)]
pub struct Cluster {
    pub tag: String,
    pub created_at: DateTime<Utc>,
    pub is_online: bool,
    /// desired number of nodes, the reconciler converges to this
    pub node_count: usize,
    pub username: String,
    pub slots_per_node: u32,
    pub shared_storage: Option<SharedStorage>,
    pub bootstrap_commands: Vec<String>,
    pub time_spent_provisioning: Duration,
    nodes: RwLock<Arc<[Node]>>,
}

impl Cluster {
    pub fn new(tag: impl Into<String>, username: impl Into<String>, addresses: &[String]) -> Self {
        let username = username.into();
        let nodes = addresses
            .iter()
            .map(|address| Node::new(address.clone(), username.clone()))
            .collect::<Vec<_>>();

        Self {
            tag: tag.into(),
            created_at: Utc::now(),
            is_online: true,
            node_count: nodes.len(),
            username,
            slots_per_node: 1,
            shared_storage: None,
            bootstrap_commands: Vec::new(),
            time_spent_provisioning: Duration::ZERO,
            nodes: RwLock::new(Arc::from(nodes)),
        }
    }

    pub fn from_record(record: ClusterRecord) -> Self {
        Self {
            tag: record.tag,
            created_at: record.created_at,
            is_online: record.is_online,
            node_count: record.node_count,
            username: record.username,
            slots_per_node: record.slots_per_node,
            shared_storage: record.shared_storage,
            bootstrap_commands: record.bootstrap_commands,
            time_spent_provisioning: record.time_spent_provisioning,
            nodes: RwLock::new(Arc::from(record.nodes)),
        }
    }

    pub fn to_record(&self) -> ClusterRecord {
        ClusterRecord {
            tag: self.tag.clone(),
            created_at: self.created_at,
            is_online: self.is_online,
            node_count: self.node_count,
            username: self.username.clone(),
            slots_per_node: self.slots_per_node,
            nodes: self.nodes().to_vec(),
            shared_storage: self.shared_storage.clone(),
            bootstrap_commands: self.bootstrap_commands.clone(),
            time_spent_provisioning: self.time_spent_provisioning,
        }
    }

    pub fn uses_shared_storage(&self) -> bool {
        self.shared_storage.is_some()
    }

    /// consistent snapshot of the current node list
    pub fn nodes(&self) -> Arc<[Node]> {
        self.nodes.read().clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.nodes()
            .iter()
            .map(|node| node.address.clone())
            .collect()
    }

    /// node at index 0, always read fresh
    pub fn control_node(&self) -> Option<Node> {
        self.nodes().first().cloned()
    }

    /// publish a new node list, returns the nodes that were not part of the previous one
    pub fn replace_nodes(&self, nodes: Vec<Node>) -> Vec<Node> {
        let mut guard = self.nodes.write();
        let delta = node_delta(&guard, &nodes);

        *guard = Arc::from(nodes);
        debug!(cluster = %self.tag, replaced = delta.len(), "Published new node list");

        delta
    }
}

/// nodes of `current` whose address is not in `previous`, in `current` order
pub fn node_delta(previous: &[Node], current: &[Node]) -> Vec<Node> {
    let known = previous
        .iter()
        .map(|node| node.address.as_str())
        .collect::<BTreeSet<_>>();

    current
        .iter()
        .filter(|node| !known.contains(node.address.as_str()))
        .cloned()
        .collect()
}

/// The one cluster a run operates on
///
/// Resolved once at the start of a run and passed down the call chain instead of re-querying
/// "the latest online cluster" at every step.
#[derive(Debug, Clone)]
pub struct ActiveCluster(Arc<Cluster>);

impl ActiveCluster {
    pub fn new(cluster: Cluster) -> Self {
        Self(Arc::new(cluster))
    }

    /// use the cluster with the given tag, or else the most recently created online cluster
    pub fn resolve<S: Store + ?Sized>(store: &S, tag: Option<&str>) -> Result<Self, StoreError> {
        let record = match tag {
            Some(tag) => store
                .find_cluster(tag)?
                .ok_or_else(|| StoreError::ClusterNotFound(tag.to_owned()))?,
            None => store
                .find_latest_online_cluster()?
                .ok_or(StoreError::NoOnlineCluster)?,
        };

        if !record.is_online {
            return Err(StoreError::ClusterOffline(record.tag));
        }

        info!(cluster = %record.tag, nodes = record.nodes.len(), "Found online cluster");

        Ok(Self::new(Cluster::from_record(record)))
    }
}

impl Deref for ActiveCluster {
    type Target = Cluster;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
