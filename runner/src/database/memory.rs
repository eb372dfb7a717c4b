use super::{Store, StoreError};
use crate::{cluster::ClusterRecord, job::JobRecord};
use parking_lot::FairMutex;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Debug, Default)]
struct Tables {
    clusters: BTreeMap<String, ClusterRecord>,
    jobs: BTreeMap<String, JobRecord>,
}

/// Volatile store, records live as long as the process
#[derive(Debug, Clone, Default)]
pub struct MemoryStore(Arc<FairMutex<Tables>>);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.0.lock().jobs.values().cloned().collect()
    }
}

impl Store for MemoryStore {
    fn save_cluster(&self, cluster: &ClusterRecord) -> Result<(), StoreError> {
        self.0
            .lock()
            .clusters
            .insert(cluster.tag.clone(), cluster.clone());

        Ok(())
    }

    fn find_cluster(&self, tag: &str) -> Result<Option<ClusterRecord>, StoreError> {
        Ok(self.0.lock().clusters.get(tag).cloned())
    }

    fn find_latest_online_cluster(&self) -> Result<Option<ClusterRecord>, StoreError> {
        Ok(self
            .0
            .lock()
            .clusters
            .values()
            .filter(|cluster| cluster.is_online)
            .max_by_key(|cluster| cluster.created_at)
            .cloned())
    }

    fn save_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.0.lock().jobs.insert(job.tag.clone(), job.clone());

        Ok(())
    }

    fn find_job(&self, tag: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.0.lock().jobs.get(tag).cloned())
    }
}
