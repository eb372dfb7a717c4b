use crate::chronometer::PhaseTimers;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{fmt, time::Duration};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job {tag} is missing required field `{field}`")]
    MissingField { tag: String, field: &'static str },
    #[error("Job {tag} cannot move from {from} to {to}")]
    IllegalTransition {
        tag: String,
        from: JobState,
        to: JobState,
    },
}

/// Classification of a single attempt, and after the retry loop the recorded result of a job
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy, Hash)]
#[repr(i8)]
pub enum JobOutcome {
    NotCompleted = 0,
    Success = 1,
    NodeEvicted = 2,
    RemoteFault = 3,
}

impl JobOutcome {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    pub fn from_repr(value: i8) -> Option<Self> {
        match value {
            0 => Some(Self::NotCompleted),
            1 => Some(Self::Success),
            2 => Some(Self::NodeEvicted),
            3 => Some(Self::RemoteFault),
            _ => None,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotCompleted => "not-completed",
            Self::Success => "success",
            Self::NodeEvicted => "node-evicted",
            Self::RemoteFault => "remote-fault",
        })
    }
}

/// Lifecycle of a job, transitions only move forward
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy, PartialOrd, Ord)]
#[repr(i8)]
pub enum JobState {
    Pending = 0,
    Setup = 1,
    Running = 2,
    Retrying = 3,
    Succeeded = 4,
    Aborted = 5,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Aborted)
    }

    pub fn from_repr(value: i8) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Setup),
            2 => Some(Self::Running),
            3 => Some(Self::Retrying),
            4 => Some(Self::Succeeded),
            5 => Some(Self::Aborted),
            _ => None,
        }
    }

    fn can_move_to(self, next: Self) -> bool {
        match (self, next) {
            (current, _) if current.is_terminal() => false,
            // every retry pass re-enters the same state
            (Self::Retrying, Self::Retrying) => true,
            // any non terminal state may abort
            (_, Self::Aborted) => true,
            // only a running (or retrying) job can finish successfully
            (Self::Running | Self::Retrying, Self::Succeeded) => true,
            (_, Self::Succeeded) => false,
            (current, next) => next > current,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A job as configured by the user
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub tag: String,
    pub setup_command: String,
    pub run_command: String,
    pub restart_command: Option<String>,
    pub outputs_path: Option<String>,
    #[serde(default)]
    pub max_retries: u32,
    // labels that make timings of different fault tolerance setups comparable
    #[serde(default = "default_label")]
    pub ft_technology: String,
    #[serde(default = "default_label")]
    pub ckpt_strategy: String,
}

fn default_label() -> String {
    "noft".to_owned()
}

impl JobSpec {
    pub fn validate(&self) -> Result<(), JobError> {
        let missing = |field| JobError::MissingField {
            tag: self.tag.clone(),
            field,
        };

        if self.tag.trim().is_empty() {
            return Err(missing("tag"));
        }
        if self.setup_command.trim().is_empty() {
            return Err(missing("setup_command"));
        }
        if self.run_command.trim().is_empty() {
            return Err(missing("run_command"));
        }

        Ok(())
    }

    /// command used after a repair, falls back to the run command
    pub fn restart_command(&self) -> &str {
        self.restart_command
            .as_deref()
            .filter(|command| !command.trim().is_empty())
            .unwrap_or(&self.run_command)
    }
}

/// Elapsed time per phase
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct PhaseTimings {
    pub setup: Duration,
    pub execute: Duration,
    pub repair: Duration,
    pub checkpoint: Duration,
    pub provisioning: Duration,
    pub total: Duration,
}

impl PhaseTimings {
    pub fn capture(timers: &PhaseTimers, provisioning: Duration) -> Self {
        Self {
            setup: timers.setup.elapsed(),
            execute: timers.execute.elapsed(),
            repair: timers.repair.elapsed(),
            checkpoint: timers.checkpoint.elapsed(),
            provisioning,
            total: timers.total.elapsed(),
        }
    }
}

/// Auditable result of running a job, persisted even if the job aborted
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct JobRecord {
    pub tag: String,
    pub cluster: String,
    pub state: JobState,
    pub outcome: JobOutcome,
    pub failure_count: u32,
    pub max_retries: u32,
    pub ft_technology: String,
    pub ckpt_strategy: String,
    pub timings: PhaseTimings,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn pending(spec: &JobSpec, cluster: &str) -> Self {
        Self {
            tag: spec.tag.clone(),
            cluster: cluster.to_owned(),
            state: JobState::Pending,
            outcome: JobOutcome::NotCompleted,
            failure_count: 0,
            max_retries: spec.max_retries,
            ft_technology: spec.ft_technology.clone(),
            ckpt_strategy: spec.ckpt_strategy.clone(),
            timings: PhaseTimings::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_move_to(next) {
            return Err(JobError::IllegalTransition {
                tag: self.tag.clone(),
                from: self.state,
                to: next,
            });
        }

        if self.started_at.is_none() && next != JobState::Pending {
            self.started_at = Some(Utc::now());
        }
        self.state = next;

        Ok(())
    }

    /// count one more eviction, returns whether the retry budget is exhausted
    pub fn record_eviction(&mut self) -> bool {
        self.failure_count += 1;

        self.failure_count > self.max_retries
    }

    pub fn finish(&mut self, outcome: JobOutcome, timings: PhaseTimings) -> Result<(), JobError> {
        let state = if outcome.is_success() {
            JobState::Succeeded
        } else {
            JobState::Aborted
        };

        self.advance(state)?;
        self.outcome = outcome;
        self.timings = timings;
        self.completed_at = Some(Utc::now());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(max_retries: u32) -> JobSpec {
        JobSpec {
            tag: "jacobi-ulfm".to_owned(),
            setup_command: "make -C /var/nfs_dir/my_files".to_owned(),
            run_command: "mpirun --hostfile hostfile ./jacobi".to_owned(),
            restart_command: None,
            outputs_path: None,
            max_retries,
            ft_technology: "ulfm".to_owned(),
            ckpt_strategy: "app-level".to_owned(),
        }
    }

    #[test]
    fn forward_transitions_are_accepted() {
        let mut record = JobRecord::pending(&spec(1), "c");

        record.advance(JobState::Setup).unwrap();
        record.advance(JobState::Running).unwrap();
        record.advance(JobState::Retrying).unwrap();
        record.advance(JobState::Retrying).unwrap();
        record.advance(JobState::Succeeded).unwrap();

        assert!(record.started_at.is_some());
    }

    #[test]
    fn backward_transitions_are_rejected() {
        let mut record = JobRecord::pending(&spec(1), "c");

        record.advance(JobState::Running).unwrap();
        assert!(record.advance(JobState::Setup).is_err());
        record.advance(JobState::Aborted).unwrap();
        assert!(record.advance(JobState::Retrying).is_err());
    }

    #[test]
    fn setup_cannot_succeed_directly() {
        let mut record = JobRecord::pending(&spec(0), "c");

        record.advance(JobState::Setup).unwrap();
        assert!(record.advance(JobState::Succeeded).is_err());
    }

    #[test]
    fn retry_budget_counts_the_first_eviction() {
        let mut record = JobRecord::pending(&spec(2), "c");

        assert!(!record.record_eviction());
        assert!(!record.record_eviction());
        assert!(record.record_eviction());
        assert_eq!(record.failure_count, 3);
    }

    #[test]
    fn restart_falls_back_to_run_command() {
        let mut job = spec(0);
        assert_eq!(job.restart_command(), job.run_command);

        job.restart_command = Some("mpirun --restart ./jacobi".to_owned());
        assert_eq!(job.restart_command(), "mpirun --restart ./jacobi");
    }

    #[test]
    fn labels_default_to_noft_and_reach_the_record() {
        let job: JobSpec = serde_yaml::from_str(
            "tag: heat\nsetup_command: make\nrun_command: mpirun ./heat\n",
        )
        .unwrap();
        assert_eq!(job.ft_technology, "noft");
        assert_eq!(job.ckpt_strategy, "noft");

        let record = JobRecord::pending(&spec(1), "c");
        assert_eq!(record.ft_technology, "ulfm");
        assert_eq!(record.ckpt_strategy, "app-level");
    }

    #[test]
    fn missing_commands_are_configuration_errors() {
        let mut job = spec(0);
        job.run_command = "  ".to_owned();

        assert_eq!(
            job.validate(),
            Err(JobError::MissingField {
                tag: "jacobi-ulfm".to_owned(),
                field: "run_command"
            })
        );
    }
}
