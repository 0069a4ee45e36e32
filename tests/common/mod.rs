//! In-memory storage nodes and a wired-up proxy for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use futures_util::StreamExt;
use repoward::common::{
    Config, Error, MetricsRegistry, NodeConfig, ReplicationPolicy, Result, VirtualStorageConfig,
    Vote,
};
use repoward::coordinator::node::{parse_address, ByteStream, Dialer, NodeClient};
use repoward::coordinator::{
    ConsistentStoragesCache, Coordinator, HealthManager, RepositoryKey, Replicator,
    TransactionManager,
};
use repoward::datastore::{ChangeFeed, QueuePolicy, RocksDatastore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const VIRTUAL_STORAGE: &str = "default";
pub const CREATE: &str = "RepositoryService/CreateRepository";
pub const WRITE: &str = "OperationService/UserCommitFiles";
pub const REMOVE: &str = "RepositoryService/RemoveRepository";
pub const READ: &str = "CommitService/FindCommit";
pub const READ_STREAM: &str = "RefService/FindAllBranches";

type Registry = Arc<Mutex<HashMap<String, Arc<FakeNode>>>>;

/// One storage node keeping repositories in memory
pub struct FakeNode {
    pub storage: String,
    peers: Registry,
    healthy: AtomicBool,
    fail_prepare: AtomicBool,
    replicate_failures: AtomicU32,
    vote_override: Mutex<Option<Vote>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    commit_delay: Mutex<Duration>,
    repos: Mutex<HashMap<String, Bytes>>,
    prepared: Mutex<HashMap<u64, (String, String, Bytes)>>,
    pub prepares: AtomicUsize,
    pub reads: AtomicUsize,
    /// Request chunks of streaming accessors, as received
    pub streamed: Mutex<Vec<Bytes>>,
    pub committed: Mutex<Vec<u64>>,
    pub aborted: Mutex<Vec<u64>>,
    pub replicated: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl FakeNode {
    fn new(storage: &str, peers: Registry) -> Self {
        Self {
            storage: storage.to_string(),
            peers,
            healthy: AtomicBool::new(true),
            fail_prepare: AtomicBool::new(false),
            replicate_failures: AtomicU32::new(0),
            vote_override: Mutex::new(None),
            gate: Mutex::new(None),
            commit_delay: Mutex::new(Duration::ZERO),
            repos: Mutex::new(HashMap::new()),
            prepared: Mutex::new(HashMap::new()),
            prepares: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
            streamed: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            replicated: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reachable(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    /// Vote this instead of the fingerprint of the payload
    pub fn vote_with(&self, vote: Option<Vote>) {
        *self.vote_override.lock().unwrap() = vote;
    }

    /// Fail the next `n` replicate calls
    pub fn fail_replications(&self, n: u32) {
        self.replicate_failures.store(n, Ordering::SeqCst);
    }

    /// Block prepares until `open_gate`
    pub fn close_gate(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Sleep this long before applying a commit
    pub fn delay_commit(&self, delay: Duration) {
        *self.commit_delay.lock().unwrap() = delay;
    }

    pub fn content(&self, replica_path: &str) -> Option<Bytes> {
        self.repos.lock().unwrap().get(replica_path).cloned()
    }

    pub fn has_replica(&self, replica_path: &str) -> bool {
        self.repos.lock().unwrap().contains_key(replica_path)
    }

    pub fn committed(&self) -> Vec<u64> {
        self.committed.lock().unwrap().clone()
    }

    pub fn aborted(&self) -> Vec<u64> {
        self.aborted.lock().unwrap().clone()
    }

    pub fn prepared(&self) -> usize {
        self.prepared.lock().unwrap().len()
    }

    fn read(&self, replica_path: &str) -> Result<Bytes> {
        self.content(replica_path).ok_or_else(|| Error::NodeStatus {
            status: 404,
            message: format!("{} not found on {}", replica_path, self.storage),
        })
    }
}

#[tonic::async_trait]
impl NodeClient for FakeNode {
    async fn check(&self, _timeout: Duration) -> Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Http("connection refused".into()))
        }
    }

    async fn call(&self, _method: &str, replica_path: &str, _payload: Bytes) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let content = self.read(replica_path)?;
        Ok(Bytes::from(format!(
            "{}:{}",
            self.storage,
            String::from_utf8_lossy(&content)
        )))
    }

    async fn call_stream(
        &self,
        _method: &str,
        replica_path: &str,
        mut payload: ByteStream,
    ) -> Result<ByteStream> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        while let Some(chunk) = payload.next().await {
            let chunk = chunk?;
            if !chunk.is_empty() {
                self.streamed.lock().unwrap().push(chunk);
            }
        }
        let content = self.read(replica_path)?;
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from(format!("{}:", self.storage))),
            Ok(content),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn prepare(
        &self,
        transaction_id: u64,
        method: &str,
        replica_path: &str,
        payload: Bytes,
    ) -> Result<Vote> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| Error::Internal("gate closed".into()))?;
        }
        self.prepares.fetch_add(1, Ordering::SeqCst);
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::Http("prepare failed".into()));
        }
        let vote = self
            .vote_override
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Vote::of(&payload));
        self.prepared.lock().unwrap().insert(
            transaction_id,
            (method.to_string(), replica_path.to_string(), payload),
        );
        Ok(vote)
    }

    async fn commit(&self, transaction_id: u64) -> Result<Bytes> {
        let delay = *self.commit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let (method, replica_path, payload) = self
            .prepared
            .lock()
            .unwrap()
            .remove(&transaction_id)
            .ok_or_else(|| Error::Internal(format!("transaction {} not prepared", transaction_id)))?;
        if method == REMOVE {
            self.repos.lock().unwrap().remove(&replica_path);
        } else {
            self.repos.lock().unwrap().insert(replica_path, payload);
        }
        self.committed.lock().unwrap().push(transaction_id);
        Ok(Bytes::from(format!("committed:{}", self.storage)))
    }

    async fn abort(&self, transaction_id: u64) -> Result<()> {
        self.prepared.lock().unwrap().remove(&transaction_id);
        self.aborted.lock().unwrap().push(transaction_id);
        Ok(())
    }

    async fn replicate(&self, replica_path: &str, source: &NodeConfig) -> Result<()> {
        let remaining = self.replicate_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.replicate_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Http("replication stream reset".into()));
        }
        let source = self
            .peers
            .lock()
            .unwrap()
            .get(&source.storage)
            .cloned()
            .ok_or_else(|| Error::Other(format!("unknown source {}", source.storage)))?;
        let content = source.read(replica_path)?;
        self.repos
            .lock()
            .unwrap()
            .insert(replica_path.to_string(), content);
        self.replicated
            .lock()
            .unwrap()
            .push(replica_path.to_string());
        Ok(())
    }

    async fn remove(&self, replica_path: &str) -> Result<()> {
        self.repos.lock().unwrap().remove(replica_path);
        self.removed.lock().unwrap().push(replica_path.to_string());
        Ok(())
    }

    async fn snapshot(&self, relative_path: &str) -> Result<ByteStream> {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"bundle:")),
            Ok(Bytes::from(format!("{}:{}", self.storage, relative_path))),
        ];
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

/// Set of fake nodes, addressable by storage name
#[derive(Clone, Default)]
pub struct FakeCluster {
    nodes: Registry,
}

impl FakeCluster {
    pub fn new(storages: &[&str]) -> Self {
        let cluster = Self::default();
        for storage in storages {
            cluster.add(storage);
        }
        cluster
    }

    pub fn add(&self, storage: &str) -> Arc<FakeNode> {
        let node = Arc::new(FakeNode::new(storage, self.nodes.clone()));
        self.nodes
            .lock()
            .unwrap()
            .insert(storage.to_string(), node.clone());
        node
    }

    pub fn node(&self, storage: &str) -> Arc<FakeNode> {
        self.nodes
            .lock()
            .unwrap()
            .get(storage)
            .cloned()
            .unwrap_or_else(|| panic!("no fake node {}", storage))
    }
}

impl Dialer for FakeCluster {
    fn dial(&self, node: &NodeConfig) -> Result<Arc<dyn NodeClient>> {
        parse_address(&node.address)?;
        let fake = self
            .nodes
            .lock()
            .unwrap()
            .get(&node.storage)
            .cloned()
            .ok_or_else(|| Error::Other(format!("no fake node {}", node.storage)))?;
        Ok(fake)
    }
}

pub fn node_config(storage: &str) -> NodeConfig {
    NodeConfig {
        storage: storage.to_string(),
        address: format!("tcp://{}:8075", storage),
        token: "secret".to_string(),
    }
}

pub fn test_config(dir: &TempDir, storages: &[&str]) -> Config {
    let mut config = Config {
        db_path: dir.path().join("db"),
        virtual_storages: vec![VirtualStorageConfig {
            name: VIRTUAL_STORAGE.to_string(),
            nodes: storages.iter().map(|s| node_config(s)).collect(),
        }],
        ..Default::default()
    };
    config.failover.probe_timeout_ms = 100;
    config.transactions.vote_timeout_ms = 2_000;
    config.transactions.cleanup_grace_ms = 200;
    config.replication.backoff_base_ms = 0;
    config.replication.backoff_max_ms = 0;
    config
}

pub fn key(relative_path: &str) -> RepositoryKey {
    RepositoryKey::new(VIRTUAL_STORAGE, relative_path)
}

/// The proxy's components wired over a fake cluster, without the HTTP layer
pub struct Harness {
    pub cluster: FakeCluster,
    pub config: Config,
    pub metrics: Arc<MetricsRegistry>,
    pub datastore: Arc<RocksDatastore>,
    pub cache: Arc<ConsistentStoragesCache>,
    pub health: Arc<HealthManager>,
    pub transactions: Arc<TransactionManager>,
    pub coordinator: Arc<Coordinator>,
    pub replicator: Arc<Replicator>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(storages: &[&str]) -> Self {
        Self::with_config(storages, |_| {})
    }

    pub fn with_policy(storages: &[&str], policy: ReplicationPolicy) -> Self {
        Self::with_config(storages, |c| c.replication.policy = policy)
    }

    pub fn with_config(storages: &[&str], adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir, storages);
        adjust(&mut config);
        let cluster = FakeCluster::new(storages);
        let metrics = Arc::new(MetricsRegistry::new());

        let (feed, events) = ChangeFeed::channel();
        let datastore = Arc::new(
            RocksDatastore::open(&config.db_path, QueuePolicy::from(&config.replication))
                .unwrap()
                .with_change_feed(feed.clone()),
        );
        let cache = Arc::new(ConsistentStoragesCache::new(
            datastore.clone(),
            &config.virtual_storage_names(),
            config.cache.max_entries_per_virtual_storage,
            config.cache.enabled,
            metrics.clone(),
        ));
        tokio::spawn(cache.clone().run(events));
        feed.connected();
        cache.connected();

        let health = Arc::new(HealthManager::connect(&config, &cluster, metrics.clone()).unwrap());
        let transactions = Arc::new(TransactionManager::new(
            config.transactions.clone(),
            metrics.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            health.clone(),
            cache.clone(),
            datastore.clone(),
            datastore.clone(),
            transactions.clone(),
            config.replication.policy,
            metrics.clone(),
        ));
        let replicator = Arc::new(Replicator::new(
            health.clone(),
            datastore.clone(),
            datastore.clone(),
            config.replication.clone(),
            metrics.clone(),
        ));

        Self {
            cluster,
            config,
            metrics,
            datastore,
            cache,
            health,
            transactions,
            coordinator,
            replicator,
            dir,
        }
    }

    pub fn node(&self, storage: &str) -> Arc<FakeNode> {
        self.cluster.node(storage)
    }

    /// Flip reachability and probe until the health manager agrees
    pub async fn set_healthy(&self, storage: &str, healthy: bool) {
        self.node(storage).set_reachable(healthy);
        let rounds = if healthy {
            self.config.failover.success_threshold
        } else {
            self.config.failover.failure_threshold
        };
        for _ in 0..rounds {
            self.health.probe_once().await;
        }
        assert_eq!(self.health.is_healthy(VIRTUAL_STORAGE, storage), healthy);
    }

    pub async fn create(&self, relative_path: &str) -> Result<Bytes> {
        self.coordinator
            .route(CREATE, &key(relative_path), Bytes::from_static(b"init"))
            .await?
            .into_bytes()
            .await
    }

    pub async fn write(&self, relative_path: &str, payload: &'static str) -> Result<Bytes> {
        self.coordinator
            .route(WRITE, &key(relative_path), Bytes::from_static(payload.as_bytes()))
            .await?
            .into_bytes()
            .await
    }

    pub async fn read(&self, relative_path: &str) -> Result<Bytes> {
        self.coordinator
            .route(READ, &key(relative_path), Bytes::new())
            .await?
            .into_bytes()
            .await
    }

    pub async fn replica_path(&self, relative_path: &str) -> String {
        use repoward::datastore::RepositoryStore;
        self.datastore
            .get_repository(VIRTUAL_STORAGE, relative_path)
            .await
            .unwrap()
            .unwrap()
            .replica_path
    }

    pub async fn generations(&self, relative_path: &str) -> Vec<(String, u64)> {
        use repoward::datastore::RepositoryStore;
        self.datastore
            .get_repository(VIRTUAL_STORAGE, relative_path)
            .await
            .unwrap()
            .map(|r| r.generations.into_iter().collect())
            .unwrap_or_default()
    }

    /// Let the cache's feed loop apply pending invalidations
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Run the replicator until the queue is drained
    pub async fn replicate_all(&self) {
        for _ in 0..10 {
            if self.replicator.run_once().await == 0 {
                return;
            }
        }
    }
}
