//! Replication job queue
//!
//! Jobs move through explicit states stored on the record itself:
//!
//! ```text
//! ready ──dequeue──▶ in_progress ──ack ok──▶ completed
//!   ▲                    │
//!   └──ack failed (attempts left, after backoff)
//!                        │
//!                        └──ack failed (budget spent)──▶ failed
//! ready/in_progress ──superseded by newer generation──▶ cancelled
//! ```
//!
//! An in-progress job whose lease expired (worker crashed) is claimable
//! again; the lost attempt counts against its budget.

use crate::common::{timestamp_now_millis, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// What a replication job does to the target replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Create => write!(f, "create"),
            ChangeType::Update => write!(f, "update"),
            ChangeType::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Ready,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Ready => write!(f, "ready"),
            JobState::InProgress => write!(f, "in_progress"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result reported by the worker for a claimed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
}

/// Request to replicate one repository onto one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub virtual_storage: String,
    pub relative_path: String,
    /// Physical location of the replica on the target
    pub replica_path: String,
    pub source_storage: String,
    pub target_storage: String,
    pub change: ChangeType,
    /// Generation the target will hold once the job completes
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationJob {
    pub id: u64,
    pub virtual_storage: String,
    pub relative_path: String,
    pub replica_path: String,
    pub source_storage: String,
    pub target_storage: String,
    pub change: ChangeType,
    pub generation: u64,
    pub state: JobState,
    pub attempt: u32,
    pub created_at: u64,
    pub updated_at: u64,
    /// Not claimable before this instant (retry backoff)
    pub not_before: u64,
    pub lease_expires_at: Option<u64>,
    pub last_error: Option<String>,
}

/// Retry and visibility rules shared by queue implementations
#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub lease_timeout_ms: u64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::from(&crate::common::ReplicationConfig::default())
    }
}

impl From<&crate::common::ReplicationConfig> for QueuePolicy {
    fn from(cfg: &crate::common::ReplicationConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            backoff_base_ms: cfg.backoff_base_ms,
            backoff_max_ms: cfg.backoff_max_ms,
            lease_timeout_ms: cfg.lease_timeout_ms,
        }
    }
}

impl QueuePolicy {
    /// Exponential backoff with up to 20% jitter
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(20);
        let base = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        if base == 0 {
            return 0;
        }
        let jitter = rand::thread_rng().gen_range(0..=base / 5);
        base + jitter
    }
}

impl ReplicationJob {
    pub fn new(id: u64, job: NewJob, now: u64) -> Self {
        Self {
            id,
            virtual_storage: job.virtual_storage,
            relative_path: job.relative_path,
            replica_path: job.replica_path,
            source_storage: job.source_storage,
            target_storage: job.target_storage,
            change: job.change,
            generation: job.generation,
            state: JobState::Ready,
            attempt: 0,
            created_at: now,
            updated_at: now,
            not_before: now,
            lease_expires_at: None,
            last_error: None,
        }
    }

    /// Same physical replica as `other`
    pub fn same_target(&self, other: &NewJob) -> bool {
        self.virtual_storage == other.virtual_storage
            && self.relative_path == other.relative_path
            && self.replica_path == other.replica_path
            && self.target_storage == other.target_storage
    }

    pub fn lease_expired(&self, now: u64) -> bool {
        self.state == JobState::InProgress && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Can a worker take this job right now?
    pub fn is_claimable(&self, now: u64) -> bool {
        match self.state {
            JobState::Ready => self.not_before <= now,
            JobState::InProgress => self.lease_expired(now),
            _ => false,
        }
    }

    /// ready → in_progress. An expired lease is charged as a failed attempt;
    /// returns `false` when that exhausted the budget and the job is now failed.
    pub fn claim(&mut self, now: u64, policy: &QueuePolicy) -> bool {
        if self.state == JobState::InProgress {
            self.attempt += 1;
            self.last_error = Some("lease expired".to_string());
            if self.attempt >= policy.max_attempts {
                self.state = JobState::Failed;
                self.lease_expires_at = None;
                self.updated_at = now;
                return false;
            }
        }
        self.state = JobState::InProgress;
        self.lease_expires_at = Some(now + policy.lease_timeout_ms);
        self.updated_at = now;
        true
    }

    /// Apply a worker outcome. Only in-progress jobs change; returns whether it did.
    pub fn acknowledge(&mut self, outcome: &JobOutcome, now: u64, policy: &QueuePolicy) -> bool {
        if self.state != JobState::InProgress {
            return false;
        }

        self.attempt += 1;
        self.lease_expires_at = None;
        self.updated_at = now;

        match outcome {
            JobOutcome::Completed => {
                self.state = JobState::Completed;
                self.last_error = None;
            }
            JobOutcome::Failed(reason) => {
                self.last_error = Some(reason.clone());
                if self.attempt >= policy.max_attempts {
                    self.state = JobState::Failed;
                } else {
                    self.state = JobState::Ready;
                    self.not_before = now + policy.backoff_ms(self.attempt);
                }
            }
        }
        true
    }

    pub fn cancel(&mut self, now: u64, reason: impl Into<String>) {
        self.state = JobState::Cancelled;
        self.lease_expires_at = None;
        self.last_error = Some(reason.into());
        self.updated_at = now;
    }
}

/// Resolve a new job against the pending jobs for the same target replica.
///
/// Returns the ids of pending jobs the new one supersedes, and whether the
/// new job is itself stale (an equal or newer generation is already pending).
pub fn resolve_supersession<'a>(
    new: &NewJob,
    pending: impl IntoIterator<Item = &'a ReplicationJob>,
) -> (Vec<u64>, bool) {
    let mut superseded = Vec::new();
    let mut stale = false;
    for job in pending {
        if job.state.is_terminal() || !job.same_target(new) {
            continue;
        }
        if job.generation < new.generation {
            superseded.push(job.id);
        } else {
            stale = true;
        }
    }
    (superseded, stale)
}

/// Claimable jobs first for healthy targets, then by age.
pub fn order_for_dequeue(jobs: &mut [ReplicationJob], healthy_targets: &HashSet<String>) {
    jobs.sort_by_key(|j| (!healthy_targets.contains(&j.target_storage), j.id));
}

/// Durable outbox of replication jobs.
#[tonic::async_trait]
pub trait ReplicationQueue: Send + Sync {
    /// Persist a job. A pending job for the same target with a lower
    /// generation is cancelled; if an equal or newer one is pending the new
    /// job is recorded as cancelled straight away.
    async fn enqueue(&self, job: NewJob) -> Result<ReplicationJob>;

    /// Claim up to `count` jobs of a virtual storage, moving them to in-progress.
    async fn dequeue(
        &self,
        virtual_storage: &str,
        count: usize,
        healthy_targets: &HashSet<String>,
    ) -> Result<Vec<ReplicationJob>>;

    /// Record the outcome of a claimed job and return its resulting state.
    /// A no-op for jobs that are not in progress.
    async fn acknowledge(&self, id: u64, outcome: JobOutcome) -> Result<JobState>;

    async fn get_job(&self, id: u64) -> Result<Option<ReplicationJob>>;

    async fn list_jobs(&self, virtual_storage: &str) -> Result<Vec<ReplicationJob>>;
}

/// Current time as used by queue implementations
pub fn now() -> u64 {
    timestamp_now_millis()
}
