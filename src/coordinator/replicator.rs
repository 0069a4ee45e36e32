//! Background replication worker
//!
//! Drains the replication queue of every virtual storage. A job whose
//! target already holds its generation is completed without touching the
//! node, so replays after a crash are harmless.

use crate::common::{MetricsRegistry, ReplicationConfig, Result};
use crate::coordinator::health::HealthManager;
use crate::datastore::queue::{ChangeType, JobOutcome, JobState, ReplicationJob, ReplicationQueue};
use crate::datastore::repositories::RepositoryStore;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Result of running one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Replicated,
    Removed,
    /// Nothing to do; the reason is logged
    Skipped(&'static str),
}

pub struct Replicator {
    health: Arc<HealthManager>,
    store: Arc<dyn RepositoryStore>,
    queue: Arc<dyn ReplicationQueue>,
    config: ReplicationConfig,
    metrics: Arc<MetricsRegistry>,
    runner: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Replicator {
    pub fn new(
        health: Arc<HealthManager>,
        store: Arc<dyn RepositoryStore>,
        queue: Arc<dyn ReplicationQueue>,
        config: ReplicationConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            health,
            store,
            queue,
            config,
            metrics,
            runner: Mutex::new(None),
        }
    }

    async fn apply(&self, job: &ReplicationJob) -> Result<Applied> {
        let vs = &job.virtual_storage;
        let target = self.health.node(vs, &job.target_storage)?;

        if job.change == ChangeType::Delete {
            target.client.remove(&job.replica_path).await?;
            // a recreated repository lives under a new replica path
            let current = self.store.get_repository(vs, &job.relative_path).await?;
            if current.is_some_and(|r| r.replica_path == job.replica_path) {
                self.store
                    .delete_replica(vs, &job.relative_path, &job.target_storage)
                    .await?;
            }
            return Ok(Applied::Removed);
        }

        let Some(record) = self.store.get_repository(vs, &job.relative_path).await? else {
            return Ok(Applied::Skipped("repository no longer exists"));
        };
        if record.replica_path != job.replica_path {
            return Ok(Applied::Skipped("repository was recreated"));
        }
        if record
            .generation(&job.target_storage)
            .is_some_and(|g| g >= job.generation)
        {
            return Ok(Applied::Skipped("target already up to date"));
        }

        let source = self.health.node(vs, &job.source_storage)?;
        target
            .client
            .replicate(&job.replica_path, &source.config)
            .await?;
        self.store
            .set_generation(vs, &job.relative_path, &job.target_storage, job.generation)
            .await?;
        Ok(Applied::Replicated)
    }

    async fn run_job(&self, job: ReplicationJob) -> Result<JobState> {
        let outcome = match self.apply(&job).await {
            Ok(applied) => {
                tracing::debug!(
                    job_id = job.id,
                    virtual_storage = %job.virtual_storage,
                    relative_path = %job.relative_path,
                    target_storage = %job.target_storage,
                    change = %job.change,
                    result = ?applied,
                    "replication job done"
                );
                JobOutcome::Completed
            }
            Err(e) => {
                let e = e.with_node(job.target_storage.clone());
                tracing::warn!(
                    job_id = job.id,
                    virtual_storage = %job.virtual_storage,
                    relative_path = %job.relative_path,
                    target_storage = %job.target_storage,
                    attempt = job.attempt + 1,
                    error = %e,
                    "replication job failed"
                );
                JobOutcome::Failed(e.to_string())
            }
        };

        let state = self.queue.acknowledge(job.id, outcome).await?;
        self.metrics
            .replication_jobs
            .inc(&[job.virtual_storage.as_str(), &state.to_string()]);
        if state == JobState::Failed {
            tracing::error!(
                job_id = job.id,
                virtual_storage = %job.virtual_storage,
                relative_path = %job.relative_path,
                target_storage = %job.target_storage,
                "replication job exhausted its retry budget"
            );
        }
        Ok(state)
    }

    /// Claim and run one batch for a virtual storage; returns how many jobs ran
    pub async fn process_batch(&self, virtual_storage: &str) -> Result<usize> {
        let healthy: HashSet<String> = self
            .health
            .healthy_nodes(virtual_storage)?
            .iter()
            .map(|n| n.storage().to_string())
            .collect();
        let jobs = self
            .queue
            .dequeue(virtual_storage, self.config.batch_size, &healthy)
            .await?;
        let count = jobs.len();

        let results = futures_util::future::join_all(jobs.into_iter().map(|job| self.run_job(job))).await;
        for result in results {
            if let Err(e) = result {
                tracing::error!(virtual_storage = %virtual_storage, error = %e, "failed to acknowledge job");
            }
        }
        Ok(count)
    }

    /// One pass over every virtual storage
    pub async fn run_once(&self) -> usize {
        let mut processed = 0;
        for vs in self.health.virtual_storages() {
            match self.process_batch(&vs).await {
                Ok(n) => processed += n,
                Err(e) => tracing::error!(virtual_storage = %vs, error = %e, "replication pass failed"),
            }
        }
        processed
    }

    pub fn start(self: &Arc<Self>) {
        let mut runner = match self.runner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if runner.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let replicator = Arc::clone(self);
        let interval = self.config.interval();
        let handle = tokio::spawn(async move {
            loop {
                // keep draining while there is work
                let processed = replicator.run_once().await;
                if processed > 0 && !*stop_rx.borrow() {
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() {
                    break;
                }
            }
            tracing::debug!("replicator stopped");
        });
        *runner = Some((stop_tx, handle));
    }

    pub async fn stop(&self) {
        let runner = match self.runner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((stop_tx, handle)) = runner {
            let _ = stop_tx.send(true);
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "replicator task ended abnormally");
            }
        }
    }
}
