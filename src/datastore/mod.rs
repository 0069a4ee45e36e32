//! Durable proxy state
//!
//! - `repositories`: generation records, the authoritative answer to
//!   "which storages are up to date"
//! - `queue`: replication job model and queue contract
//! - `notification`: change feed published on every repository mutation
//! - `rocks`: RocksDB implementation of both stores

pub mod notification;
pub mod queue;
pub mod repositories;
pub mod rocks;

pub use notification::{ChangeFeed, FeedEvent, Notification, NotificationEntry};
pub use queue::{
    ChangeType, JobOutcome, JobState, NewJob, QueuePolicy, ReplicationJob, ReplicationQueue,
};
pub use repositories::{
    ConsistentStorages, ConsistentStoragesGetter, RepositoryRecord, RepositoryStore,
};
pub use rocks::RocksDatastore;
