//! Configuration for the repoward proxy

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::{Error, Result};

/// Environment prefix for overrides, e.g. `REPOWARD__LOG_LEVEL=debug`.
pub const ENV_PREFIX: &str = "REPOWARD";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind address for the proxy HTTP API
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// RocksDB path for repository metadata and the replication queue
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Virtual storages and their physical nodes
    #[serde(default)]
    pub virtual_storages: Vec<VirtualStorageConfig>,

    #[serde(default)]
    pub failover: FailoverConfig,

    #[serde(default)]
    pub transactions: TransactionConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2305))
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./repoward-data")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A logical storage name backed by an ordered list of nodes.
/// Order is failover priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualStorageConfig {
    pub name: String,
    pub nodes: Vec<NodeConfig>,
}

/// One physical storage endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Storage name on the node, unique within its virtual storage
    pub storage: String,
    /// Connection string (`tcp://`, `tls://`, `http://`, `https://`)
    pub address: String,
    #[serde(default)]
    pub token: String,
}

/// Health probing and primary election
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// Consecutive failed probes before a node is unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive successful probes before an unhealthy node is healthy again
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_probe_interval() -> u64 {
    3_000
}
fn default_probe_timeout() -> u64 {
    1_000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_success_threshold() -> u32 {
    1
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl FailoverConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Quorum voting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// How long voters wait for the rest of the participants
    #[serde(default = "default_vote_timeout")]
    pub vote_timeout_ms: u64,
    /// Extra time a decided transaction is kept around for late voters
    #[serde(default = "default_cleanup_grace")]
    pub cleanup_grace_ms: u64,
}

fn default_vote_timeout() -> u64 {
    10_000
}
fn default_cleanup_grace() -> u64 {
    30_000
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            vote_timeout_ms: default_vote_timeout(),
            cleanup_grace_ms: default_cleanup_grace(),
        }
    }
}

impl TransactionConfig {
    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }
}

/// How secondaries take part in a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationPolicy {
    /// Forward the write to every healthy up to date secondary and vote.
    Sync,
    /// Secondaries accept the primary's vote; data follows via the queue.
    Async,
}

/// Replication queue and worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_policy")]
    pub policy: ReplicationPolicy,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// Visibility timeout for in-progress jobs
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_ms: u64,
}

fn default_policy() -> ReplicationPolicy {
    ReplicationPolicy::Sync
}
fn default_batch_size() -> usize {
    10
}
fn default_interval() -> u64 {
    1_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base() -> u64 {
    1_000
}
fn default_backoff_max() -> u64 {
    60_000
}
fn default_lease_timeout() -> u64 {
    60_000
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            batch_size: default_batch_size(),
            interval_ms: default_interval(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            lease_timeout_ms: default_lease_timeout(),
        }
    }
}

impl ReplicationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Consistent-storage cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_entries")]
    pub max_entries_per_virtual_storage: usize,
}

fn default_cache_enabled() -> bool {
    true
}
fn default_cache_entries() -> usize {
    2 << 20
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_entries_per_virtual_storage: default_cache_entries(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            db_path: default_db_path(),
            log_level: default_log_level(),
            virtual_storages: Vec::new(),
            failover: FailoverConfig::default(),
            transactions: TransactionConfig::default(),
            replication: ReplicationConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file and `REPOWARD__*`
    /// environment variables. Environment wins over the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.virtual_storages.is_empty() {
            return Err(Error::InvalidConfig("no virtual storages configured".into()));
        }

        let mut names = HashSet::new();
        for vs in &self.virtual_storages {
            if vs.name.is_empty() {
                return Err(Error::InvalidConfig("virtual storage without a name".into()));
            }
            if !names.insert(vs.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "virtual storage {:?} is configured more than once",
                    vs.name
                )));
            }
            if vs.nodes.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "virtual storage {:?} has no nodes",
                    vs.name
                )));
            }
            let mut storages = HashSet::new();
            for node in &vs.nodes {
                if !storages.insert(node.storage.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "storage {:?} is configured more than once in {:?}",
                        node.storage, vs.name
                    )));
                }
            }
        }

        if self.failover.failure_threshold == 0 || self.failover.success_threshold == 0 {
            return Err(Error::InvalidConfig("health thresholds must be positive".into()));
        }
        if self.replication.max_attempts == 0 {
            return Err(Error::InvalidConfig("max_attempts must be positive".into()));
        }

        Ok(())
    }

    pub fn virtual_storage(&self, name: &str) -> Option<&VirtualStorageConfig> {
        self.virtual_storages.iter().find(|vs| vs.name == name)
    }

    pub fn virtual_storage_names(&self) -> Vec<String> {
        self.virtual_storages.iter().map(|vs| vs.name.clone()).collect()
    }
}
