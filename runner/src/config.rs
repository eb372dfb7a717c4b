use crate::{
    cluster::{Cluster, SharedStorage},
    executors::DEFAULT_TRANSIENT_SIGNATURES,
    job::JobSpec,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{fs, io, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    Io(#[from] io::Error),
    #[error("Failed to parse config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("Config failed the preflight checks, see the log for details")]
    Preflight,
    #[error("Section `{0}` is required for this command")]
    MissingSection(&'static str),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    #[serde(alias = "db", default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    // only needed to repair a cluster
    pub provisioner: Option<ProvisionerConfig>,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    // only needed to register a cluster, runs pick the latest online one
    pub cluster: Option<ClusterConfig>,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,

    #[serde(default)]
    pub overwrite_jobs: bool,
    #[serde(default)]
    pub rerun_setup_after_repair: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub adapter: ConnectionConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum ConnectionConfig {
    #[serde(rename = "sqlite")]
    SQLite {
        #[serde(default = "default_database_path")]
        path: PathBuf,
    },
    Memory,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::SQLite {
            path: default_database_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    #[serde(default = "default_ssh")]
    pub ssh: String,
    #[serde(default = "default_scp")]
    pub scp: String,
    // passed as `-o <option>` to both binaries
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default = "default_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_timeout")]
    pub probe_timeout: u64,
    pub command_timeout: Option<u64>,
    #[serde(default = "default_transient_signatures")]
    pub transient_signatures: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh: default_ssh(),
            scp: default_scp(),
            options: Vec::new(),
            connect_timeout: default_timeout(),
            probe_timeout: default_timeout(),
            command_timeout: None,
            transient_signatures: default_transient_signatures(),
        }
    }
}

impl TransportConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ProvisionerConfig {
    // directory holding the infrastructure definition, commands run inside it
    pub working_dir: PathBuf,
    pub converge_command: String,
    pub list_command: String,
    pub timeout: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_settle_delay")]
    pub settle_delay: u64,
    #[serde(default = "default_mount_attempts")]
    pub mount_attempts: u32,
    #[serde(default = "default_mount_retry_delay")]
    pub mount_retry_delay: u64,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    pub timeout: Option<u64>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            settle_delay: default_settle_delay(),
            mount_attempts: default_mount_attempts(),
            mount_retry_delay: default_mount_retry_delay(),
            max_rounds: default_max_rounds(),
            timeout: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub tag: String,
    // falls back to the number of listed nodes
    pub node_count: Option<usize>,
    pub username: String,
    pub nodes: Vec<String>,
    #[serde(default = "default_slots_per_node")]
    pub slots_per_node: u32,
    pub shared_storage: Option<SharedStorage>,
    #[serde(default)]
    pub bootstrap_commands: Vec<String>,
    #[serde(default)]
    pub time_spent_provisioning: u64,
}

impl ClusterConfig {
    pub fn to_cluster(&self) -> Cluster {
        let mut cluster = Cluster::new(self.tag.clone(), self.username.clone(), &self.nodes);
        cluster.node_count = self.node_count.unwrap_or(self.nodes.len());
        cluster.slots_per_node = self.slots_per_node;
        cluster.shared_storage = self.shared_storage.clone();
        cluster.bootstrap_commands = self.bootstrap_commands.clone();
        cluster.time_spent_provisioning = Duration::from_secs(self.time_spent_provisioning);

        cluster
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default = "default_local_inputs")]
    pub local_inputs: PathBuf,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_hostfile")]
    pub hostfile: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            local_inputs: default_local_inputs(),
            remote_dir: default_remote_dir(),
            results_dir: default_results_dir(),
            hostfile: default_hostfile(),
        }
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn provisioner(&self) -> Result<&ProvisionerConfig, ConfigErrors> {
        self.provisioner
            .as_ref()
            .ok_or(ConfigErrors::MissingSection("provisioner"))
    }

    pub fn cluster(&self) -> Result<&ClusterConfig, ConfigErrors> {
        self.cluster
            .as_ref()
            .ok_or(ConfigErrors::MissingSection("cluster"))
    }

    /// Returns true if any check failed
    pub fn preflight_checks(&mut self) -> bool {
        // report every problem at once instead of one per run
        let mut contains_error = false;

        if self.transport.ssh.trim().is_empty() || self.transport.scp.trim().is_empty() {
            error!("transport.ssh and transport.scp must name the client binaries");
            contains_error = true;
        }
        if self.transport.probe_timeout == 0 {
            error!("transport.probe_timeout cannot be 0, every node would count as dead");
            contains_error = true;
        }
        if self.transport.transient_signatures.is_empty() {
            warn!("transport.transient_signatures is empty, only lost connections count as evictions");
        }
        self.transport
            .transient_signatures
            .retain(|signature| !signature.trim().is_empty());

        if let Some(provisioner) = &self.provisioner {
            if !provisioner.working_dir.is_dir() {
                error!(
                    "provisioner.working_dir ({}) is not a directory",
                    provisioner.working_dir.to_string_lossy()
                );
                contains_error = true;
            }
            if provisioner.converge_command.trim().is_empty()
                || provisioner.list_command.trim().is_empty()
            {
                error!("provisioner.converge_command and provisioner.list_command cannot be empty");
                contains_error = true;
            }
        }

        if self.reconciler.max_rounds == 0 {
            error!("reconciler.max_rounds cannot be 0, a degraded cluster could never be repaired");
            contains_error = true;
        }
        if self.reconciler.mount_attempts == 0 {
            error!("reconciler.mount_attempts cannot be 0");
            contains_error = true;
        }

        if let Some(cluster) = &self.cluster {
            if cluster.tag.trim().is_empty() {
                error!("cluster.tag cannot be empty");
                contains_error = true;
            }
            if cluster.nodes.is_empty() {
                error!("cluster {} has no nodes", cluster.tag);
                contains_error = true;
            }
            match cluster.node_count {
                Some(0) => {
                    error!("cluster {}.node_count cannot be 0", cluster.tag);
                    contains_error = true;
                }
                Some(count) if count != cluster.nodes.len() => warn!(
                    "cluster {} lists {} nodes but wants {count}, the first repair will converge it",
                    cluster.tag,
                    cluster.nodes.len()
                ),
                _ => {}
            }
            if cluster.slots_per_node == 0 {
                error!("cluster {}.slots_per_node cannot be 0", cluster.tag);
                contains_error = true;
            }
            if let Some(storage) = &cluster.shared_storage {
                if storage.mount_commands.is_empty() {
                    warn!("cluster {} uses shared storage without mount commands", cluster.tag);
                }
            }
            let listed = cluster.nodes.iter().counts_by(|address| address.as_str());
            for (address, count) in listed {
                if count > 1 {
                    error!("cluster {} lists node {address} {count} times", cluster.tag);
                    contains_error = true;
                }
            }
        }

        let remote_dir = self.workspace.remote_dir.trim_end_matches('/');
        if !remote_dir.starts_with('/') || remote_dir.is_empty() {
            error!(
                "workspace.remote_dir ({}) must be an absolute path below /, it is wiped before every job",
                self.workspace.remote_dir
            );
            contains_error = true;
        }
        if self.workspace.hostfile.trim().is_empty() || self.workspace.hostfile.contains('/') {
            error!("workspace.hostfile must be a plain file name");
            contains_error = true;
        }

        for job in self.jobs.iter() {
            if let Err(error) = job.validate() {
                error!("{error}");
                contains_error = true;
            }
        }
        for (tag, count) in self.jobs.iter().counts_by(|job| job.tag.as_str()) {
            if count > 1 {
                error!("Job tag {tag} is used {count} times, tags must be unique");
                contains_error = true;
            }
        }

        contains_error
    }

    /// Checks only `run` needs on top of `preflight_checks`, returns true if any failed
    pub fn run_checks(&self) -> bool {
        let mut contains_error = false;

        if !self.workspace.local_inputs.is_dir() {
            error!(
                "workspace.local_inputs ({}) is not a directory",
                self.workspace.local_inputs.to_string_lossy()
            );
            contains_error = true;
        }
        if self.jobs.is_empty() {
            warn!("No jobs were defined, nothing to run");
        }

        contains_error
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("hpcac.db")
}

fn default_ssh() -> String {
    "ssh".to_owned()
}

fn default_scp() -> String {
    "scp".to_owned()
}

fn default_timeout() -> u64 {
    3
}

fn default_transient_signatures() -> Vec<String> {
    DEFAULT_TRANSIENT_SIGNATURES.clone()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_settle_delay() -> u64 {
    15
}

fn default_mount_attempts() -> u32 {
    10
}

fn default_mount_retry_delay() -> u64 {
    5
}

fn default_max_rounds() -> u32 {
    3
}

fn default_slots_per_node() -> u32 {
    1
}

fn default_local_inputs() -> PathBuf {
    PathBuf::from("./my_files")
}

fn default_remote_dir() -> String {
    "/var/nfs_dir/my_files".to_owned()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("./results")
}

fn default_hostfile() -> String {
    "hostfile".to_owned()
}
