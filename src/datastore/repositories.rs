//! Authoritative record of repository generations
//!
//! Every logical repository has one record holding the generation each
//! physical storage has applied. The storages holding the highest
//! generation are the consistent (up to date) ones.

use crate::common::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Replica path plus the storages holding the latest generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistentStorages {
    pub replica_path: String,
    pub storages: BTreeSet<String>,
}

/// Repository record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub repository_id: u64,
    pub virtual_storage: String,
    pub relative_path: String,
    pub replica_path: String,
    /// storage name → applied generation
    pub generations: BTreeMap<String, u64>,
}

impl RepositoryRecord {
    /// Highest generation applied anywhere, `None` if no replica exists
    pub fn max_generation(&self) -> Option<u64> {
        self.generations.values().copied().max()
    }

    pub fn generation(&self, storage: &str) -> Option<u64> {
        self.generations.get(storage).copied()
    }

    pub fn consistent_storages(&self) -> BTreeSet<String> {
        match self.max_generation() {
            Some(max) => self
                .generations
                .iter()
                .filter(|(_, &g)| g == max)
                .map(|(s, _)| s.clone())
                .collect(),
            None => BTreeSet::new(),
        }
    }

    pub fn to_consistent(&self) -> ConsistentStorages {
        ConsistentStorages {
            replica_path: self.replica_path.clone(),
            storages: self.consistent_storages(),
        }
    }
}

/// Lookup of up to date storages, consumed by the cache.
#[tonic::async_trait]
pub trait ConsistentStoragesGetter: Send + Sync {
    /// Replica path and set of up to date storages for a repository.
    async fn get_consistent_storages(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<ConsistentStorages>;
}

/// Generation bookkeeping for repositories
#[tonic::async_trait]
pub trait RepositoryStore: ConsistentStoragesGetter {
    /// Record a new repository at generation 0 on `storages`.
    async fn create_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storages: &[String],
    ) -> Result<RepositoryRecord>;

    async fn get_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<Option<RepositoryRecord>>;

    /// Bump the repository to `max + 1` on exactly the `updated` storages.
    async fn increment_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        updated: &[String],
    ) -> Result<u64>;

    /// Raise a storage to `generation`. Never lowers it; returns whether it changed.
    async fn set_generation(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
        generation: u64,
    ) -> Result<bool>;

    /// Forget one storage's replica (after it was removed on the node).
    async fn delete_replica(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        storage: &str,
    ) -> Result<()>;

    async fn delete_repository(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<RepositoryRecord>;

    async fn list_repositories(&self, virtual_storage: &str) -> Result<Vec<RepositoryRecord>>;
}
