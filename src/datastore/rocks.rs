//! Durable datastore using RocksDB
//!
//! Stores:
//! - Repository records (generation per storage), keyed `vs \0 relative_path`
//! - Replication jobs, keyed by id, retained after they reach a terminal state
//! - A pending index of non-terminal jobs per virtual storage
//! - Id counters

use crate::common::{Error, Result};
use crate::datastore::notification::ChangeFeed;
use crate::datastore::queue::{
    now, order_for_dequeue, resolve_supersession, JobOutcome, JobState, NewJob, QueuePolicy,
    ReplicationJob, ReplicationQueue,
};
use crate::datastore::repositories::{
    ConsistentStorages, ConsistentStoragesGetter, RepositoryRecord, RepositoryStore,
};
use crate::common::hash::derive_replica_path;
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

const CF_REPOSITORIES: &str = "repositories";
const CF_JOBS: &str = "replication_jobs";
const CF_PENDING: &str = "replication_pending";
const CF_META: &str = "meta";

const NEXT_REPOSITORY_ID: &[u8] = b"next_repository_id";
const NEXT_JOB_ID: &[u8] = b"next_job_id";

/// RocksDB-backed repository store and replication queue
pub struct RocksDatastore {
    db: DB,
    policy: QueuePolicy,
    feed: Option<ChangeFeed>,
    /// Serializes read-modify-write sequences
    write_lock: Mutex<()>,
}

fn repository_key(virtual_storage: &str, relative_path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(virtual_storage.len() + relative_path.len() + 1);
    key.extend_from_slice(virtual_storage.as_bytes());
    key.push(0);
    key.extend_from_slice(relative_path.as_bytes());
    key
}

fn prefix(virtual_storage: &str) -> Vec<u8> {
    let mut key = virtual_storage.as_bytes().to_vec();
    key.push(0);
    key
}

fn pending_key(virtual_storage: &str, id: u64) -> Vec<u8> {
    let mut key = prefix(virtual_storage);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

impl RocksDatastore {
    /// Open or create the datastore
    pub fn open(path: impl AsRef<Path>, policy: QueuePolicy) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![CF_REPOSITORIES, CF_JOBS, CF_PENDING, CF_META],
        )?;

        Ok(Self {
            db,
            policy,
            feed: None,
            write_lock: Mutex::new(()),
        })
    }

    /// Publish repository changes on `feed`
    pub fn with_change_feed(mut self, feed: ChangeFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Corrupted(format!("missing column family {}", name)))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Internal("datastore lock poisoned".into()))
    }

    fn notify(&self, virtual_storage: &str, relative_path: &str) {
        if let Some(feed) = &self.feed {
            feed.publish([(virtual_storage, relative_path)]);
        }
    }

    fn next_id(&self, batch: &mut WriteBatch, counter: &[u8]) -> Result<u64> {
        let cf = self.cf(CF_META)?;
        let current = match self.db.get_cf(cf, counter)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Corrupted("invalid id counter".into()))?;
                u64::from_le_bytes(arr)
            }
            None => 1,
        };
        batch.put_cf(cf, counter, (current + 1).to_le_bytes());
        Ok(current)
    }

    // === Repository operations ===

    fn read_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Option<RepositoryRecord>> {
        let cf = self.cf(CF_REPOSITORIES)?;
        match self
            .db
            .get_cf(cf, repository_key(virtual_storage, relative_path))?
        {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<RepositoryRecord> {
        self.read_repository(virtual_storage, relative_path)?
            .ok_or_else(|| Error::RepositoryNotFound {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
            })
    }

    fn write_repository(&self, record: &RepositoryRecord) -> Result<()> {
        let cf = self.cf(CF_REPOSITORIES)?;
        self.db.put_cf(
            cf,
            repository_key(&record.virtual_storage, &record.relative_path),
            bincode::serialize(record)?,
        )?;
        Ok(())
    }

    fn create_repository_sync(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storages: &[String],
    ) -> Result<RepositoryRecord> {
        let _guard = self.lock()?;
        if self.read_repository(virtual_storage, relative_path)?.is_some() {
            return Err(Error::RepositoryExists {
                virtual_storage: virtual_storage.to_string(),
                relative_path: relative_path.to_string(),
            });
        }

        let mut batch = WriteBatch::default();
        let repository_id = self.next_id(&mut batch, NEXT_REPOSITORY_ID)?;
        let record = RepositoryRecord {
            repository_id,
            virtual_storage: virtual_storage.to_string(),
            relative_path: relative_path.to_string(),
            replica_path: derive_replica_path(repository_id),
            generations: storages.iter().map(|s| (s.clone(), 0)).collect(),
        };
        batch.put_cf(
            self.cf(CF_REPOSITORIES)?,
            repository_key(virtual_storage, relative_path),
            bincode::serialize(&record)?,
        );
        self.db.write(batch)?;

        self.notify(virtual_storage, relative_path);
        Ok(record)
    }

    fn increment_generation_sync(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        updated: &[String],
    ) -> Result<u64> {
        let _guard = self.lock()?;
        let mut record = self.require_repository(virtual_storage, relative_path)?;
        let generation = record.max_generation().map(|g| g + 1).unwrap_or(0);
        for storage in updated {
            record.generations.insert(storage.clone(), generation);
        }
        self.write_repository(&record)?;

        self.notify(virtual_storage, relative_path);
        Ok(generation)
    }

    fn set_generation_sync(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: u64,
    ) -> Result<bool> {
        let _guard = self.lock()?;
        let mut record = self.require_repository(virtual_storage, relative_path)?;
        if record.generation(storage).is_some_and(|g| g >= generation) {
            return Ok(false);
        }
        record.generations.insert(storage.to_string(), generation);
        self.write_repository(&record)?;

        self.notify(virtual_storage, relative_path);
        Ok(true)
    }

    fn delete_replica_sync(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<()> {
        let _guard = self.lock()?;
        let Some(mut record) = self.read_repository(virtual_storage, relative_path)? else {
            return Ok(());
        };
        if record.generations.remove(storage).is_some() {
            self.write_repository(&record)?;
            self.notify(virtual_storage, relative_path);
        }
        Ok(())
    }

    fn delete_repository_sync(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<RepositoryRecord> {
        let _guard = self.lock()?;
        let record = self.require_repository(virtual_storage, relative_path)?;
        self.db.delete_cf(
            self.cf(CF_REPOSITORIES)?,
            repository_key(virtual_storage, relative_path),
        )?;

        self.notify(virtual_storage, relative_path);
        Ok(record)
    }

    fn list_repositories_sync(&self, virtual_storage: &str) -> Result<Vec<RepositoryRecord>> {
        let cf = self.cf(CF_REPOSITORIES)?;
        let prefix = prefix(virtual_storage);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    // === Queue operations ===

    fn read_job(&self, id: u64) -> Result<Option<ReplicationJob>> {
        let cf = self.cf(CF_JOBS)?;
        match self.db.get_cf(cf, id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Stage a job write, keeping the pending index in step with its state
    fn stage_job(&self, batch: &mut WriteBatch, job: &ReplicationJob) -> Result<()> {
        batch.put_cf(self.cf(CF_JOBS)?, job.id.to_be_bytes(), bincode::serialize(job)?);
        let pending = pending_key(&job.virtual_storage, job.id);
        if job.state.is_terminal() {
            batch.delete_cf(self.cf(CF_PENDING)?, pending);
        } else {
            batch.put_cf(self.cf(CF_PENDING)?, pending, []);
        }
        Ok(())
    }

    fn pending_jobs(&self, virtual_storage: &str) -> Result<Vec<ReplicationJob>> {
        let cf = self.cf(CF_PENDING)?;
        let prefix = prefix(virtual_storage);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut jobs = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let id_bytes: [u8; 8] = key[prefix.len()..]
                .try_into()
                .map_err(|_| Error::Corrupted("invalid pending job key".into()))?;
            let id = u64::from_be_bytes(id_bytes);
            match self.read_job(id)? {
                Some(job) => jobs.push(job),
                None => tracing::warn!(job_id = id, "pending index points at missing job"),
            }
        }
        Ok(jobs)
    }

    fn enqueue_sync(&self, new: NewJob) -> Result<ReplicationJob> {
        let _guard = self.lock()?;
        let now = now();
        let pending = self.pending_jobs(&new.virtual_storage)?;
        let (superseded, stale) = resolve_supersession(&new, &pending);

        let mut batch = WriteBatch::default();
        for mut job in pending.into_iter().filter(|j| superseded.contains(&j.id)) {
            job.cancel(now, format!("superseded by generation {}", new.generation));
            tracing::debug!(
                job_id = job.id,
                virtual_storage = %job.virtual_storage,
                relative_path = %job.relative_path,
                target_storage = %job.target_storage,
                "replication job superseded"
            );
            self.stage_job(&mut batch, &job)?;
        }

        let id = self.next_id(&mut batch, NEXT_JOB_ID)?;
        let mut job = ReplicationJob::new(id, new, now);
        if stale {
            job.cancel(now, "a newer generation is already pending");
        }
        self.stage_job(&mut batch, &job)?;
        self.db.write(batch)?;

        Ok(job)
    }

    fn dequeue_sync(
        &self,
        virtual_storage: &str,
        count: usize,
        healthy_targets: &HashSet<String>,
    ) -> Result<Vec<ReplicationJob>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.lock()?;
        let now = now();

        let mut candidates: Vec<ReplicationJob> = self
            .pending_jobs(virtual_storage)?
            .into_iter()
            .filter(|j| j.is_claimable(now))
            .collect();
        order_for_dequeue(&mut candidates, healthy_targets);

        let mut batch = WriteBatch::default();
        let mut claimed = Vec::new();
        for mut job in candidates {
            if claimed.len() == count {
                break;
            }
            let live = job.claim(now, &self.policy);
            self.stage_job(&mut batch, &job)?;
            if live {
                claimed.push(job);
            } else {
                tracing::warn!(
                    job_id = job.id,
                    attempts = job.attempt,
                    "replication job failed after its lease expired too often"
                );
            }
        }
        self.db.write(batch)?;

        Ok(claimed)
    }

    fn acknowledge_sync(&self, id: u64, outcome: JobOutcome) -> Result<JobState> {
        let _guard = self.lock()?;
        let mut job = self.read_job(id)?.ok_or(Error::JobNotFound(id))?;
        if job.acknowledge(&outcome, now(), &self.policy) {
            let mut batch = WriteBatch::default();
            self.stage_job(&mut batch, &job)?;
            self.db.write(batch)?;
        }
        Ok(job.state)
    }

    fn list_jobs_sync(&self, virtual_storage: &str) -> Result<Vec<ReplicationJob>> {
        let cf = self.cf(CF_JOBS)?;
        let mut jobs = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let job: ReplicationJob = bincode::deserialize(&value)?;
            if job.virtual_storage == virtual_storage {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[tonic::async_trait]
impl ConsistentStoragesGetter for RocksDatastore {
    async fn get_consistent_storages(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<ConsistentStorages> {
        Ok(self
            .require_repository(virtual_storage, relative_path)?
            .to_consistent())
    }
}

#[tonic::async_trait]
impl RepositoryStore for RocksDatastore {
    async fn create_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storages: &[String],
    ) -> Result<RepositoryRecord> {
        self.create_repository_sync(virtual_storage, relative_path, storages)
    }

    async fn get_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Option<RepositoryRecord>> {
        self.read_repository(virtual_storage, relative_path)
    }

    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        updated: &[String],
    ) -> Result<u64> {
        self.increment_generation_sync(virtual_storage, relative_path, updated)
    }

    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: u64,
    ) -> Result<bool> {
        self.set_generation_sync(virtual_storage, relative_path, storage, generation)
    }

    async fn delete_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<()> {
        self.delete_replica_sync(virtual_storage, relative_path, storage)
    }

    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<RepositoryRecord> {
        self.delete_repository_sync(virtual_storage, relative_path)
    }

    async fn list_repositories(&self, virtual_storage: &str) -> Result<Vec<RepositoryRecord>> {
        self.list_repositories_sync(virtual_storage)
    }
}

#[tonic::async_trait]
impl ReplicationQueue for RocksDatastore {
    async fn enqueue(&self, job: NewJob) -> Result<ReplicationJob> {
        self.enqueue_sync(job)
    }

    async fn dequeue(
        &self,
        virtual_storage: &str,
        count: usize,
        healthy_targets: &HashSet<String>,
    ) -> Result<Vec<ReplicationJob>> {
        self.dequeue_sync(virtual_storage, count, healthy_targets)
    }

    async fn acknowledge(&self, id: u64, outcome: JobOutcome) -> Result<JobState> {
        self.acknowledge_sync(id, outcome)
    }

    async fn get_job(&self, id: u64) -> Result<Option<ReplicationJob>> {
        self.read_job(id)
    }

    async fn list_jobs(&self, virtual_storage: &str) -> Result<Vec<ReplicationJob>> {
        self.list_jobs_sync(virtual_storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::notification::{decode_payload, FeedEvent};
    use crate::datastore::queue::ChangeType;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn policy() -> QueuePolicy {
        QueuePolicy {
            max_attempts: 3,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
            lease_timeout_ms: 60_000,
        }
    }

    fn job(target: &str, generation: u64) -> NewJob {
        NewJob {
            virtual_storage: "default".into(),
            relative_path: "repo.git".into(),
            replica_path: "@cluster/repositories/6b/86/1".into(),
            source_storage: "gitaly-1".into(),
            target_storage: target.into(),
            change: ChangeType::Update,
            generation,
        }
    }

    fn storages(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_generations() {
        let dir = tempdir().unwrap();
        let store = RocksDatastore::open(dir.path(), policy()).unwrap();

        let rec = store
            .create_repository("default", "repo.git", &storages(&["gitaly-1", "gitaly-2"]))
            .await
            .unwrap();
        assert!(rec.replica_path.starts_with("@cluster/repositories/"));

        let generation = store
            .increment_generation("default", "repo.git", &storages(&["gitaly-1"]))
            .await
            .unwrap();
        assert_eq!(generation, 1);

        let consistent = store
            .get_consistent_storages("default", "repo.git")
            .await
            .unwrap();
        assert_eq!(consistent.storages.len(), 1);
        assert!(consistent.storages.contains("gitaly-1"));

        assert!(store
            .set_generation("default", "repo.git", "gitaly-2", 1)
            .await
            .unwrap());
        assert!(!store
            .set_generation("default", "repo.git", "gitaly-2", 0)
            .await
            .unwrap());
        let consistent = store
            .get_consistent_storages("default", "repo.git")
            .await
            .unwrap();
        assert_eq!(consistent.storages.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dequeue_claims_each_job_once() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RocksDatastore::open(dir.path(), policy()).unwrap());
        let healthy: HashSet<String> = ["gitaly-2".to_string()].into();

        let mut enqueued = HashSet::new();
        for i in 0..40 {
            let mut new = job("gitaly-2", 1);
            new.relative_path = format!("repo-{}.git", i);
            enqueued.insert(store.enqueue(new).await.unwrap().id);
        }

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let healthy = healthy.clone();
                tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    loop {
                        let batch = store.dequeue("default", 3, &healthy).await.unwrap();
                        if batch.is_empty() {
                            return claimed;
                        }
                        claimed.extend(batch.into_iter().map(|j| j.id));
                    }
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.await.unwrap() {
                assert!(seen.insert(id), "job {} claimed twice", id);
            }
        }
        assert_eq!(seen, enqueued);
    }

    #[tokio::test]
    async fn test_unknown_repository() {
        let dir = tempdir().unwrap();
        let store = RocksDatastore::open(dir.path(), policy()).unwrap();
        let err = store
            .get_consistent_storages("default", "missing.git")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RepositoryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_mutations_publish_notifications() {
        let dir = tempdir().unwrap();
        let (feed, mut rx) = ChangeFeed::channel();
        let store = RocksDatastore::open(dir.path(), policy())
            .unwrap()
            .with_change_feed(feed);

        store
            .create_repository("default", "repo.git", &storages(&["gitaly-1"]))
            .await
            .unwrap();

        let FeedEvent::Notification(n) = rx.recv().await.unwrap() else {
            panic!("expected notification");
        };
        let entries = decode_payload(&n.payload).unwrap();
        assert_eq!(entries[0].virtual_storage, "default");
        assert_eq!(entries[0].relative_paths, vec!["repo.git".to_string()]);
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let dir = tempdir().unwrap();
        let id = {
            let store = RocksDatastore::open(dir.path(), policy()).unwrap();
            let job = store.enqueue(job("gitaly-2", 1)).await.unwrap();
            store.flush().unwrap();
            job.id
        };

        let store = RocksDatastore::open(dir.path(), policy()).unwrap();
        let jobs = store
            .dequeue("default", 10, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, id);
        assert_eq!(jobs[0].state, JobState::InProgress);

        // claimed jobs are not handed out twice
        assert!(store
            .dequeue("default", 10, &HashSet::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = RocksDatastore::open(dir.path(), policy()).unwrap();
        let id = store.enqueue(job("gitaly-2", 1)).await.unwrap().id;
        store.dequeue("default", 1, &HashSet::new()).await.unwrap();

        let state = store.acknowledge(id, JobOutcome::Completed).await.unwrap();
        assert_eq!(state, JobState::Completed);
        let before = store.get_job(id).await.unwrap().unwrap();

        let state = store
            .acknowledge(id, JobOutcome::Failed("late".into()))
            .await
            .unwrap();
        assert_eq!(state, JobState::Completed);
        assert_eq!(store.get_job(id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_retry_budget_terminates_in_failed() {
        let dir = tempdir().unwrap();
        let store = RocksDatastore::open(dir.path(), policy()).unwrap();
        let id = store.enqueue(job("gitaly-2", 1)).await.unwrap().id;

        for _ in 0..3 {
            let jobs = store.dequeue("default", 1, &HashSet::new()).await.unwrap();
            assert_eq!(jobs.len(), 1);
            store
                .acknowledge(id, JobOutcome::Failed("unreachable".into()))
                .await
                .unwrap();
        }

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempt, 3);
        assert!(store
            .dequeue("default", 1, &HashSet::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_newer_generation_supersedes_pending_job() {
        let dir = tempdir().unwrap();
        let store = RocksDatastore::open(dir.path(), policy()).unwrap();
        let old = store.enqueue(job("gitaly-2", 1)).await.unwrap();
        let new = store.enqueue(job("gitaly-2", 2)).await.unwrap();
        let stale = store.enqueue(job("gitaly-2", 1)).await.unwrap();

        assert_eq!(
            store.get_job(old.id).await.unwrap().unwrap().state,
            JobState::Cancelled
        );
        assert_eq!(new.state, JobState::Ready);
        assert_eq!(stale.state, JobState::Cancelled);

        let jobs = store.dequeue("default", 10, &HashSet::new()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, new.id);
        assert_eq!(store.list_jobs("default").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let dir = tempdir().unwrap();
        let store = RocksDatastore::open(
            dir.path(),
            QueuePolicy {
                lease_timeout_ms: 0,
                ..policy()
            },
        )
        .unwrap();
        let id = store.enqueue(job("gitaly-2", 1)).await.unwrap().id;

        let first = store.dequeue("default", 1, &HashSet::new()).await.unwrap();
        assert_eq!(first.len(), 1);

        // the owning worker never acknowledged; its lease is already over
        let second = store.dequeue("default", 1, &HashSet::new()).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, id);
        assert_eq!(second[0].attempt, 1);
    }
}
