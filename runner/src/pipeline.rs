pub mod hostfile;

use crate::{
    chronometer::PhaseTimers,
    cluster::{ActiveCluster, Cluster, Node},
    config::RunnerConfig,
    database::{Store, StoreError},
    executors::RemoteExecutor,
    job::{JobError, JobOutcome, JobRecord, JobSpec, JobState, PhaseTimings},
    reconciler::Reconciler,
    sync::CancellationToken,
};
use itertools::Itertools;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid job configuration")]
    Job(#[from] JobError),
    #[error("Job {0} already exists, use --overwrite to replace it")]
    DuplicateJob(String),
    #[error("Failed to persist a record")]
    Store(#[from] StoreError),
    #[error("Run was cancelled, {0} jobs were left pending")]
    Cancelled(usize),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub local_inputs: PathBuf,
    pub remote_dir: String,
    pub results_dir: PathBuf,
    pub hostfile: String,
    pub rerun_setup_after_repair: bool,
}

impl PipelineSettings {
    pub fn load(config: &RunnerConfig) -> Self {
        Self {
            local_inputs: config.workspace.local_inputs.clone(),
            remote_dir: config.workspace.remote_dir.trim_end_matches('/').to_owned(),
            results_dir: config.workspace.results_dir.clone(),
            hostfile: config.workspace.hostfile.clone(),
            rerun_setup_after_repair: config.rerun_setup_after_repair,
        }
    }
}

/// Runs a queue of jobs, one at a time, on the active cluster
///
/// Per job: setup on the control node, execute, and on eviction repair the cluster and restart
/// until the retry budget runs out. The job record is persisted on every state change and always
/// once more with the final outcome and timings.
#[derive(Debug)]
pub struct Pipeline {
    executor: RemoteExecutor,
    reconciler: Reconciler,
    store: Arc<dyn Store>,
    settings: PipelineSettings,
    token: CancellationToken,
}

impl Pipeline {
    pub fn new(
        executor: RemoteExecutor,
        reconciler: Reconciler,
        store: Arc<dyn Store>,
        settings: PipelineSettings,
        token: CancellationToken,
    ) -> Self {
        Self {
            executor,
            reconciler,
            store,
            settings,
            token,
        }
    }

    #[instrument(skip_all, fields(cluster = %cluster.tag, jobs = jobs.len()), level = "info")]
    pub fn run_queue(
        &self,
        cluster: &ActiveCluster,
        jobs: &[JobSpec],
        overwrite: bool,
    ) -> Result<Vec<JobRecord>, PipelineError> {
        if let Some(tag) = jobs.iter().map(|job| job.tag.as_str()).duplicates().next() {
            return Err(PipelineError::DuplicateJob(tag.to_owned()));
        }
        for job in jobs.iter() {
            job.validate()?;

            if !overwrite && self.store.job_exists(&job.tag)? {
                return Err(PipelineError::DuplicateJob(job.tag.clone()));
            }
        }

        let pending = jobs
            .iter()
            .map(|job| JobRecord::pending(job, &cluster.tag))
            .collect_vec();
        for record in pending.iter() {
            self.store.save_job(record)?;
        }
        info!("Inserted {} pending jobs", pending.len());

        let mut finished = Vec::with_capacity(jobs.len());
        for (index, (spec, record)) in jobs.iter().zip(pending).enumerate() {
            if self.token.is_cancelled() {
                let left = jobs.len() - index;
                warn!(left, "Run cancelled, remaining jobs stay pending");

                return Err(PipelineError::Cancelled(left));
            }

            finished.push(self.run_job(cluster, spec, record)?);
        }

        Ok(finished)
    }

    #[instrument(
        skip_all,
        fields(job = %spec.tag, ft = %spec.ft_technology, ckpt = %spec.ckpt_strategy),
        level = "info"
    )]
    pub fn run_job(
        &self,
        cluster: &Cluster,
        spec: &JobSpec,
        mut record: JobRecord,
    ) -> Result<JobRecord, PipelineError> {
        let mut timers = PhaseTimers::new();
        timers.total.resume();

        let outcome = self.attempt(cluster, spec, &mut record, &mut timers)?;
        if outcome.is_success() {
            self.collect(cluster, spec);
        }

        timers.stop_all();
        record.finish(
            outcome,
            PhaseTimings::capture(&timers, cluster.time_spent_provisioning),
        )?;
        self.store.save_job(&record)?;

        let timings = &record.timings;
        match record.state {
            JobState::Succeeded => info!(
                failures = record.failure_count,
                setup = ?timings.setup,
                execute = ?timings.execute,
                repair = ?timings.repair,
                total = ?timings.total,
                "Job succeeded"
            ),
            _ => error!(
                outcome = %record.outcome,
                failures = record.failure_count,
                setup = ?timings.setup,
                execute = ?timings.execute,
                repair = ?timings.repair,
                total = ?timings.total,
                "Job aborted"
            ),
        }

        Ok(record)
    }

    /// drive one job through setup, execution and the retry loop, returns the final outcome
    fn attempt(
        &self,
        cluster: &Cluster,
        spec: &JobSpec,
        record: &mut JobRecord,
        timers: &mut PhaseTimers,
    ) -> Result<JobOutcome, PipelineError> {
        timers.repair.resume();
        let ready = self.ensure_healthy(cluster);
        timers.repair.stop();
        if !ready {
            return Ok(JobOutcome::NotCompleted);
        }

        record.advance(JobState::Setup)?;
        self.store.save_job(record)?;
        timers.setup.resume();
        let outcome = self.setup(cluster, spec);
        timers.setup.stop();
        if !outcome.is_success() {
            error!(phase = "setup", outcome = %outcome, "Setup failed, aborting job");

            return Ok(outcome);
        }

        record.advance(JobState::Running)?;
        self.store.save_job(record)?;
        let mut outcome = self.execute(cluster, &spec.run_command, timers);

        while outcome == JobOutcome::NodeEvicted {
            if record.record_eviction() {
                error!(
                    failures = record.failure_count,
                    max_retries = record.max_retries,
                    "Retries exhausted, aborting job"
                );
                break;
            }
            if self.token.is_cancelled() {
                warn!(failures = record.failure_count, "Run cancelled, aborting job");
                break;
            }

            record.advance(JobState::Retrying)?;
            self.store.save_job(record)?;
            warn!(
                phase = "repair",
                attempt = record.failure_count,
                max_retries = record.max_retries,
                "Node evicted, repairing cluster"
            );

            timers.repair.resume();
            let repaired = self.repair(cluster);
            timers.repair.stop();
            let replaced = match repaired {
                Some(replaced) => replaced,
                None => break,
            };

            if !replaced.is_empty() {
                let refreshed = if self.settings.rerun_setup_after_repair {
                    timers.setup.resume();
                    let outcome = self.setup(cluster, spec);
                    timers.setup.stop();

                    outcome
                } else {
                    timers.repair.resume();
                    let outcome = self.refresh_hostfile(cluster);
                    timers.repair.stop();

                    outcome
                };

                if !refreshed.is_success() {
                    error!(phase = "setup", outcome = %refreshed, "Workspace refresh failed, aborting job");
                    outcome = refreshed;
                    break;
                }
            }

            outcome = self.execute(cluster, spec.restart_command(), timers);
        }

        Ok(outcome)
    }

    /// probe the cluster and repair it before a job touches it
    fn ensure_healthy(&self, cluster: &Cluster) -> bool {
        if self.reconciler.prober().is_healthy(cluster) {
            return true;
        }

        warn!("Cluster degraded before job start, repairing");
        self.repair(cluster).is_some()
    }

    /// run the reconciler, returns the replaced nodes or `None` if the cluster is lost
    fn repair(&self, cluster: &Cluster) -> Option<Vec<Node>> {
        match self.reconciler.reconcile(cluster) {
            Ok(report) => {
                info!(
                    phase = "repair",
                    rounds = report.rounds,
                    replaced = report.replaced.len(),
                    control_replaced = report.control_node_replaced(cluster),
                    "Cluster ready"
                );

                Some(report.replaced)
            }
            Err(error) => {
                error!(phase = "repair", error = %error, "Reconciliation failed, aborting job");

                None
            }
        }
    }

    fn in_workspace(&self, command: &str) -> String {
        format!("cd {} && {command}", self.settings.remote_dir)
    }

    fn control_node(cluster: &Cluster) -> Option<Node> {
        let control = cluster.control_node();
        if control.is_none() {
            error!(cluster = %cluster.tag, "Cluster has no nodes");
        }

        control
    }

    /// wipe the remote workspace, upload the inputs and run the setup command on the control node
    fn setup(&self, cluster: &Cluster, spec: &JobSpec) -> JobOutcome {
        let control = match Self::control_node(cluster) {
            Some(control) => control,
            None => return JobOutcome::NotCompleted,
        };
        let remote_dir = self.settings.remote_dir.as_str();
        let parent = Path::new(remote_dir)
            .parent()
            .map(|parent| parent.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_owned());
        info!(phase = "setup", node = %control.address, "Setting up job");

        let outcome = self
            .executor
            .run(&control, &format!("rm -rf {remote_dir} && mkdir -p {parent}"));
        if !outcome.is_success() {
            return outcome;
        }

        if let Err(error) = hostfile::write(
            &self.settings.local_inputs,
            &self.settings.hostfile,
            &cluster.nodes(),
            cluster.slots_per_node,
        ) {
            error!(phase = "setup", error = %error, "Failed to write hostfile");

            return JobOutcome::NotCompleted;
        }

        let outcome = self
            .executor
            .upload(&self.settings.local_inputs, &control, remote_dir);
        if !outcome.is_success() {
            return outcome;
        }

        let outcome = self
            .executor
            .run(&control, &self.in_workspace(&spec.setup_command));
        info!(phase = "setup", node = %control.address, outcome = %outcome, "Setup finished");

        outcome
    }

    /// replaced nodes invalidate the uploaded hostfile, push a fresh one to the control node
    fn refresh_hostfile(&self, cluster: &Cluster) -> JobOutcome {
        let control = match Self::control_node(cluster) {
            Some(control) => control,
            None => return JobOutcome::NotCompleted,
        };

        let path = match hostfile::write(
            &self.settings.local_inputs,
            &self.settings.hostfile,
            &cluster.nodes(),
            cluster.slots_per_node,
        ) {
            Ok(path) => path,
            Err(error) => {
                error!(phase = "repair", error = %error, "Failed to write hostfile");

                return JobOutcome::NotCompleted;
            }
        };

        let remote = format!("{}/{}", self.settings.remote_dir, self.settings.hostfile);
        self.executor.upload(&path, &control, &remote)
    }

    fn execute(&self, cluster: &Cluster, command: &str, timers: &mut PhaseTimers) -> JobOutcome {
        let control = match Self::control_node(cluster) {
            Some(control) => control,
            None => return JobOutcome::NotCompleted,
        };
        info!(phase = "execute", node = %control.address, command, "Executing job");

        timers.execute.resume();
        let outcome = self.executor.run(&control, &self.in_workspace(command));
        timers.execute.stop();

        info!(phase = "execute", node = %control.address, outcome = %outcome, "Execution attempt finished");

        outcome
    }

    /// download declared outputs into `<results_dir>/<tag>`, failures never change the job status
    fn collect(&self, cluster: &Cluster, spec: &JobSpec) {
        let outputs = match spec.outputs_path.as_deref() {
            Some(outputs) if !outputs.trim().is_empty() => outputs,
            _ => return,
        };
        let control = match Self::control_node(cluster) {
            Some(control) => control,
            None => return,
        };

        let remote = if outputs.starts_with('/') {
            outputs.to_owned()
        } else {
            format!("{}/{outputs}", self.settings.remote_dir)
        };
        let local = self.settings.results_dir.join(&spec.tag);

        if let Err(error) = fs::create_dir_all(&local) {
            warn!(phase = "collect", local = ?local, error = %error, "Failed to create results directory");
            return;
        }

        match self.executor.download(&control, &remote, &local) {
            JobOutcome::Success => info!(phase = "collect", local = ?local, "Collected results"),
            outcome => warn!(
                phase = "collect",
                outcome = %outcome,
                "Failed to collect results, job status is kept"
            ),
        }
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
