//! Proxy server
//!
//! Wires the datastore, change feed, cache, health manager, transaction
//! manager, router and replication worker together and serves the HTTP API.

use crate::common::{Config, MetricsRegistry, Result};
use crate::coordinator::cache::ConsistentStoragesCache;
use crate::coordinator::health::HealthManager;
use crate::coordinator::http::{create_router, ProxyState};
use crate::coordinator::node::{Dialer, HttpDialer};
use crate::coordinator::replicator::Replicator;
use crate::coordinator::router::Coordinator;
use crate::coordinator::transactions::TransactionManager;
use crate::datastore::notification::ChangeFeed;
use crate::datastore::queue::{QueuePolicy, ReplicationQueue};
use crate::datastore::repositories::{ConsistentStoragesGetter, RepositoryStore};
use crate::datastore::rocks::RocksDatastore;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// A running proxy: background loops are live, the HTTP API is not yet bound
pub struct Proxy {
    config: Config,
    state: ProxyState,
    health: Arc<HealthManager>,
    cache: Arc<ConsistentStoragesCache>,
    replicator: Arc<Replicator>,
    feed: ChangeFeed,
    tasks: Vec<JoinHandle<()>>,
}

impl Proxy {
    /// Start with nodes dialed over HTTP
    pub fn start(config: Config) -> Result<Self> {
        let dialer = HttpDialer::new(Some(config.failover.probe_timeout()))?;
        Self::start_with_dialer(config, &dialer)
    }

    /// Start with a custom dialer. Must run inside a tokio runtime.
    pub fn start_with_dialer(config: Config, dialer: &dyn Dialer) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(MetricsRegistry::new());

        let (feed, events) = ChangeFeed::channel();
        let datastore = Arc::new(
            RocksDatastore::open(&config.db_path, QueuePolicy::from(&config.replication))?
                .with_change_feed(feed.clone()),
        );
        let store: Arc<dyn RepositoryStore> = datastore.clone();
        let queue: Arc<dyn ReplicationQueue> = datastore.clone();
        let getter: Arc<dyn ConsistentStoragesGetter> = datastore;

        let cache = Arc::new(ConsistentStoragesCache::new(
            getter,
            &config.virtual_storage_names(),
            config.cache.max_entries_per_virtual_storage,
            config.cache.enabled,
            metrics.clone(),
        ));
        let mut tasks = vec![tokio::spawn(cache.clone().run(events))];
        feed.connected();

        let health = Arc::new(HealthManager::connect(&config, dialer, metrics.clone())?);
        health.start(config.failover.probe_interval());
        tasks.push(tokio::spawn(log_primary_changes(health.clone())));

        let transactions = Arc::new(TransactionManager::new(
            config.transactions.clone(),
            metrics.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            health.clone(),
            cache.clone(),
            store.clone(),
            queue.clone(),
            transactions,
            config.replication.policy,
            metrics.clone(),
        ));

        let replicator = Arc::new(Replicator::new(
            health.clone(),
            store.clone(),
            queue.clone(),
            config.replication.clone(),
            metrics.clone(),
        ));
        replicator.start();

        tracing::info!(
            virtual_storages = config.virtual_storages.len(),
            db_path = %config.db_path.display(),
            policy = ?config.replication.policy,
            "proxy started"
        );

        Ok(Self {
            config,
            state: ProxyState {
                coordinator,
                store,
                queue,
                metrics,
            },
            health,
            cache,
            replicator,
            feed,
            tasks,
        })
    }

    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    pub fn cache(&self) -> &Arc<ConsistentStoragesCache> {
        &self.cache
    }

    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }

    /// Serve the HTTP API until `shutdown` resolves, then stop
    pub async fn serve_with_shutdown<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(addr = %listener.local_addr()?, "proxy API listening");
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;
        self.stop().await;
        served?;
        Ok(())
    }

    /// Bind the configured address and serve until ctrl-c
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await
    }

    /// Stop background loops
    pub async fn stop(self) {
        self.replicator.stop().await;
        self.health.stop().await;
        self.feed.disconnected("proxy stopping");
        for task in self.tasks {
            task.abort();
        }
        tracing::info!("proxy stopped");
    }
}

async fn log_primary_changes(health: Arc<HealthManager>) {
    let mut changes = health.subscribe();
    loop {
        match changes.recv().await {
            Ok(change) => tracing::warn!(
                virtual_storage = %change.virtual_storage,
                previous = ?change.previous,
                current = ?change.current,
                "primary changed"
            ),
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "missed primary change events")
            }
            Err(RecvError::Closed) => break,
        }
    }
}
