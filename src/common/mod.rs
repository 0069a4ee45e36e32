//! Common utilities and types shared across repoward

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod tracing_middleware;
pub mod utils;

pub use config::{
    CacheConfig, Config, FailoverConfig, NodeConfig, ReplicationConfig, ReplicationPolicy,
    TransactionConfig, VirtualStorageConfig,
};
pub use error::{AggregateError, Error, Result};
pub use hash::{derive_replica_path, Vote};
pub use metrics::MetricsRegistry;
pub use utils::{
    encode_segment, format_bytes, timestamp_now_millis, validate_relative_path,
};
