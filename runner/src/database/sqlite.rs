use super::{Store, StoreError};
use crate::{
    cluster::{ClusterRecord, Node, SharedStorage},
    job::{JobOutcome, JobRecord, JobState, PhaseTimings},
};
use chrono::{DateTime, Utc};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::{debug, error, info};

/// Transparent, thread safe wrapper over a rusqlite `Connection`
#[derive(Debug, Clone)]
pub struct SharedConnection(Arc<FairMutex<Connection>>);

impl SharedConnection {
    pub fn new(connection: Connection) -> Result<Self, StoreError> {
        let shared = Self(Arc::new(FairMutex::new(connection)));
        shared.init()?;

        Ok(shared)
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!(path = ?path, "Opening SQLite database");

        Self::new(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, Connection> {
        self.0.lock_arc()
    }

    fn init(&self) -> Result<(), StoreError> {
        let connection = self.lock();

        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            let counter = counter + 1;

            match connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(StoreError::SQLite(error));
                }
            };
        }

        Ok(())
    }

    /// close the underlying connection, only succeeds for the last handle
    pub fn close(self) -> Result<(), StoreError> {
        let mut connection = match Arc::try_unwrap(self.0) {
            Ok(mutex) => mutex.into_inner(),
            Err(_) => {
                debug!("SQLite connection still shared, leaving it open");

                return Ok(());
            }
        };

        let mut counter = 0;
        while let Err((returned, error)) = connection.close() {
            counter += 1;
            connection = returned;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close SQLite connection, giving up");

                return Err(StoreError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

fn duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or_default()
}

struct ClusterRow {
    tag: String,
    created_at: DateTime<Utc>,
    is_online: bool,
    node_count: i64,
    username: String,
    slots_per_node: u32,
    nodes: String,
    shared_storage: Option<String>,
    bootstrap_commands: String,
    provisioning: f64,
}

impl ClusterRow {
    const COLUMNS: &'static str = "tag, created_at, is_online, node_count, username, \
        slots_per_node, nodes, shared_storage, bootstrap_commands, provisioning_secs";

    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            tag: row.get(0)?,
            created_at: row.get(1)?,
            is_online: row.get(2)?,
            node_count: row.get(3)?,
            username: row.get(4)?,
            slots_per_node: row.get(5)?,
            nodes: row.get(6)?,
            shared_storage: row.get(7)?,
            bootstrap_commands: row.get(8)?,
            provisioning: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<ClusterRecord, StoreError> {
        let shared_storage = match self.shared_storage {
            Some(storage) => Some(serde_yaml::from_str::<SharedStorage>(&storage)?),
            None => None,
        };

        Ok(ClusterRecord {
            node_count: usize::try_from(self.node_count)
                .map_err(|_| StoreError::Corrupt(format!("node_count of {}", self.tag)))?,
            tag: self.tag,
            created_at: self.created_at,
            is_online: self.is_online,
            username: self.username,
            slots_per_node: self.slots_per_node,
            nodes: serde_yaml::from_str::<Vec<Node>>(&self.nodes)?,
            shared_storage,
            bootstrap_commands: serde_yaml::from_str(&self.bootstrap_commands)?,
            time_spent_provisioning: duration(self.provisioning),
        })
    }
}

struct JobRow {
    tag: String,
    cluster: String,
    state: i8,
    outcome: i8,
    failure_count: u32,
    max_retries: u32,
    ft_technology: String,
    ckpt_strategy: String,
    timings: [f64; 6],
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    const COLUMNS: &'static str = "tag, cluster, state, outcome, failure_count, max_retries, \
        ft_technology, ckpt_strategy, setup_secs, execute_secs, repair_secs, checkpoint_secs, provisioning_secs, total_secs, \
        created_at, started_at, completed_at";

    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            tag: row.get(0)?,
            cluster: row.get(1)?,
            state: row.get(2)?,
            outcome: row.get(3)?,
            failure_count: row.get(4)?,
            max_retries: row.get(5)?,
            ft_technology: row.get(6)?,
            ckpt_strategy: row.get(7)?,
            timings: [
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
                row.get(11)?,
                row.get(12)?,
                row.get(13)?,
            ],
            created_at: row.get(14)?,
            started_at: row.get(15)?,
            completed_at: row.get(16)?,
        })
    }

    fn into_record(self) -> Result<JobRecord, StoreError> {
        let [setup, execute, repair, checkpoint, provisioning, total] = self.timings;

        Ok(JobRecord {
            state: JobState::from_repr(self.state)
                .ok_or_else(|| StoreError::Corrupt(format!("state of job {}", self.tag)))?,
            outcome: JobOutcome::from_repr(self.outcome)
                .ok_or_else(|| StoreError::Corrupt(format!("outcome of job {}", self.tag)))?,
            tag: self.tag,
            cluster: self.cluster,
            failure_count: self.failure_count,
            max_retries: self.max_retries,
            ft_technology: self.ft_technology,
            ckpt_strategy: self.ckpt_strategy,
            timings: PhaseTimings {
                setup: duration(setup),
                execute: duration(execute),
                repair: duration(repair),
                checkpoint: duration(checkpoint),
                provisioning: duration(provisioning),
                total: duration(total),
            },
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

impl Store for SharedConnection {
    fn save_cluster(&self, cluster: &ClusterRecord) -> Result<(), StoreError> {
        let shared_storage = match &cluster.shared_storage {
            Some(storage) => Some(serde_yaml::to_string(storage)?),
            None => None,
        };

        self.lock()
            .prepare_cached(
                "insert or replace into clusters
                 (tag, created_at, is_online, node_count, username, slots_per_node,
                  nodes, shared_storage, bootstrap_commands, provisioning_secs)
                 values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                cluster.tag,
                cluster.created_at,
                cluster.is_online,
                cluster.node_count as i64,
                cluster.username,
                cluster.slots_per_node,
                serde_yaml::to_string(&cluster.nodes)?,
                shared_storage,
                serde_yaml::to_string(&cluster.bootstrap_commands)?,
                seconds(cluster.time_spent_provisioning),
            ])?;

        debug!(cluster = %cluster.tag, nodes = cluster.nodes.len(), "Stored cluster");

        Ok(())
    }

    fn find_cluster(&self, tag: &str) -> Result<Option<ClusterRecord>, StoreError> {
        let query = format!("select {} from clusters where tag = ?", ClusterRow::COLUMNS);

        let connection = self.lock();
        let mut statement = connection.prepare_cached(&query)?;
        let found = statement.query_row(params![tag], ClusterRow::read).optional()?;

        found.map(ClusterRow::into_record).transpose()
    }

    fn find_latest_online_cluster(&self) -> Result<Option<ClusterRecord>, StoreError> {
        let query = format!(
            "select {} from clusters where is_online = 1 order by created_at desc limit 1",
            ClusterRow::COLUMNS
        );

        let connection = self.lock();
        let mut statement = connection.prepare_cached(&query)?;
        let found = statement.query_row([], ClusterRow::read).optional()?;

        found.map(ClusterRow::into_record).transpose()
    }

    fn save_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let timings = &job.timings;

        self.lock()
            .prepare_cached(
                "insert or replace into jobs
                 (tag, cluster, state, outcome, failure_count, max_retries,
                  ft_technology, ckpt_strategy,
                  setup_secs, execute_secs, repair_secs, checkpoint_secs, provisioning_secs,
                  total_secs, created_at, started_at, completed_at)
                 values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                job.tag,
                job.cluster,
                job.state as i8,
                job.outcome as i8,
                job.failure_count,
                job.max_retries,
                job.ft_technology,
                job.ckpt_strategy,
                seconds(timings.setup),
                seconds(timings.execute),
                seconds(timings.repair),
                seconds(timings.checkpoint),
                seconds(timings.provisioning),
                seconds(timings.total),
                job.created_at,
                job.started_at,
                job.completed_at,
            ])?;

        debug!(job = %job.tag, state = %job.state, outcome = %job.outcome, "Stored job");

        Ok(())
    }

    fn find_job(&self, tag: &str) -> Result<Option<JobRecord>, StoreError> {
        let query = format!("select {} from jobs where tag = ?", JobRow::COLUMNS);

        let connection = self.lock();
        let mut statement = connection.prepare_cached(&query)?;
        let found = statement.query_row(params![tag], JobRow::read).optional()?;

        found.map(JobRow::into_record).transpose()
    }
}

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists clusters (
    tag text primary key,
    created_at text not null,
    is_online integer not null,
    node_count integer not null,
    username text not null,
    slots_per_node integer not null,
    nodes text not null,
    shared_storage text,
    bootstrap_commands text not null,
    provisioning_secs real not null
);",
    "create table if not exists jobs (
    tag text primary key,
    cluster text not null references clusters (tag),
    state tinyint not null,
    outcome tinyint not null,
    failure_count integer not null,
    max_retries integer not null,
    ft_technology text not null default 'noft',
    ckpt_strategy text not null default 'noft',

    setup_secs real not null,
    execute_secs real not null,
    repair_secs real not null,
    checkpoint_secs real not null,
    provisioning_secs real not null,
    total_secs real not null,

    created_at text not null,
    started_at text,
    completed_at text
);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
