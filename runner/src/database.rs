pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use crate::{
    cluster::ClusterRecord,
    config::{ConnectionConfig, DatabaseConfig},
    job::JobRecord,
};
use std::fmt::Debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("SQLite error")]
    SQLite(#[from] rusqlite::Error),
    #[error("Failed to (de)serialize stored value")]
    Serialization(#[from] serde_yaml::Error),
    #[error("Stored value is corrupt: {0}")]
    Corrupt(String),
    #[error("Adapter `{0}` is not available in this build")]
    Unsupported(&'static str),
    #[error("Cluster {0} not found")]
    ClusterNotFound(String),
    #[error("Cluster {0} is not online")]
    ClusterOffline(String),
    #[error("No online clusters available")]
    NoOnlineCluster,
}

/// Durable home of cluster and job records
pub trait Store: Send + Sync + Debug {
    /// insert or replace the cluster with the same tag
    fn save_cluster(&self, cluster: &ClusterRecord) -> Result<(), StoreError>;

    fn find_cluster(&self, tag: &str) -> Result<Option<ClusterRecord>, StoreError>;

    /// the most recently created cluster that is still online
    fn find_latest_online_cluster(&self) -> Result<Option<ClusterRecord>, StoreError>;

    /// insert or replace the job with the same tag
    fn save_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    fn find_job(&self, tag: &str) -> Result<Option<JobRecord>, StoreError>;

    fn job_exists(&self, tag: &str) -> Result<bool, StoreError> {
        Ok(self.find_job(tag)?.is_some())
    }
}

/// All storage adapters a config can select
#[derive(Debug)]
pub enum StorageAdapters {
    #[cfg(feature = "sqlite")]
    SQLite(sqlite::SharedConnection),
    Memory(memory::MemoryStore),
}

impl StorageAdapters {
    pub fn load(config: &DatabaseConfig) -> Result<Self, StoreError> {
        match &config.adapter {
            #[cfg(feature = "sqlite")]
            ConnectionConfig::SQLite { path } => Ok(Self::SQLite(
                sqlite::SharedConnection::open(path)?,
            )),
            #[cfg(not(feature = "sqlite"))]
            ConnectionConfig::SQLite { .. } => Err(StoreError::Unsupported("sqlite")),
            ConnectionConfig::Memory => Ok(Self::Memory(memory::MemoryStore::new())),
        }
    }

    pub fn close(self) -> Result<(), StoreError> {
        match self {
            #[cfg(feature = "sqlite")]
            Self::SQLite(connection) => connection.close(),
            Self::Memory(_) => Ok(()),
        }
    }

    fn inner(&self) -> &dyn Store {
        match self {
            #[cfg(feature = "sqlite")]
            Self::SQLite(connection) => connection,
            Self::Memory(store) => store,
        }
    }
}

impl Store for StorageAdapters {
    fn save_cluster(&self, cluster: &ClusterRecord) -> Result<(), StoreError> {
        self.inner().save_cluster(cluster)
    }

    fn find_cluster(&self, tag: &str) -> Result<Option<ClusterRecord>, StoreError> {
        self.inner().find_cluster(tag)
    }

    fn find_latest_online_cluster(&self) -> Result<Option<ClusterRecord>, StoreError> {
        self.inner().find_latest_online_cluster()
    }

    fn save_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.inner().save_job(job)
    }

    fn find_job(&self, tag: &str) -> Result<Option<JobRecord>, StoreError> {
        self.inner().find_job(tag)
    }
}
