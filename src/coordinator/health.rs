//! Node health tracking and primary election
//!
//! Each node carries atomic probe counters. A healthy node turns unhealthy
//! after `failure_threshold` consecutive failed probes and comes back after
//! `success_threshold` consecutive successes. Every node starts healthy.
//!
//! Per virtual storage the primary is the first healthy node in configured
//! order, except that a primary which is still healthy keeps the role.

use crate::common::{Config, Error, FailoverConfig, MetricsRegistry, Result};
use crate::coordinator::node::{Dialer, Node};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Primary role moved within a virtual storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryChange {
    pub virtual_storage: String,
    pub previous: Option<String>,
    pub current: Option<String>,
}

/// Snapshot of one node's health, for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub virtual_storage: String,
    pub storage: String,
    pub address: String,
    pub healthy: bool,
    pub primary: bool,
    pub consecutive_failures: u32,
}

struct NodeState {
    node: Node,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

impl NodeState {
    fn new(node: Node) -> Self {
        Self {
            node,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            consecutive_successes: AtomicU32::new(0),
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Apply a probe result; returns the new health if it changed
    fn record(&self, ok: bool, config: &FailoverConfig) -> Option<bool> {
        if ok {
            self.consecutive_failures.store(0, Ordering::Release);
            let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
            if !self.is_healthy() && successes >= config.success_threshold {
                self.healthy.store(true, Ordering::Release);
                return Some(true);
            }
        } else {
            self.consecutive_successes.store(0, Ordering::Release);
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            if self.is_healthy() && failures >= config.failure_threshold {
                self.healthy.store(false, Ordering::Release);
                return Some(false);
            }
        }
        None
    }
}

struct VirtualStorageState {
    name: String,
    nodes: Vec<NodeState>,
    primary: RwLock<Option<usize>>,
}

impl VirtualStorageState {
    fn primary_index(&self) -> Option<usize> {
        self.primary.read().ok().and_then(|p| *p)
    }

    /// Re-elect the primary; returns the change if there was one
    fn elect(&self) -> Option<PrimaryChange> {
        let mut primary = match self.primary.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = *primary;
        let elected = match previous {
            Some(i) if self.nodes[i].is_healthy() => Some(i),
            _ => self.nodes.iter().position(NodeState::is_healthy),
        };
        if elected == previous {
            return None;
        }
        *primary = elected;

        let name = |i: Option<usize>| i.map(|i| self.nodes[i].node.storage().to_string());
        Some(PrimaryChange {
            virtual_storage: self.name.clone(),
            previous: name(previous),
            current: name(elected),
        })
    }
}

/// Probes nodes and answers "which nodes may serve traffic"
pub struct HealthManager {
    storages: Vec<VirtualStorageState>,
    index: HashMap<String, usize>,
    config: FailoverConfig,
    metrics: Arc<MetricsRegistry>,
    events: broadcast::Sender<PrimaryChange>,
    runner: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl HealthManager {
    /// Track the given nodes, grouped by virtual storage in priority order
    pub fn new(
        storages: Vec<(String, Vec<Node>)>,
        config: FailoverConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let storages: Vec<VirtualStorageState> = storages
            .into_iter()
            .map(|(name, nodes)| VirtualStorageState {
                name,
                primary: RwLock::new(if nodes.is_empty() { None } else { Some(0) }),
                nodes: nodes.into_iter().map(NodeState::new).collect(),
            })
            .collect();
        let index = storages
            .iter()
            .enumerate()
            .map(|(i, vs)| (vs.name.clone(), i))
            .collect();
        let (events, _) = broadcast::channel(64);

        Self {
            storages,
            index,
            config,
            metrics,
            events,
            runner: Mutex::new(None),
        }
    }

    /// Dial every configured node
    pub fn connect(
        config: &Config,
        dialer: &dyn Dialer,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        let mut storages = Vec::with_capacity(config.virtual_storages.len());
        for vs in &config.virtual_storages {
            let mut nodes = Vec::with_capacity(vs.nodes.len());
            for node in &vs.nodes {
                let client = dialer
                    .dial(node)
                    .map_err(|e| e.on_node(node.storage.clone()))?;
                nodes.push(Node {
                    virtual_storage: vs.name.clone(),
                    config: node.clone(),
                    client,
                });
            }
            storages.push((vs.name.clone(), nodes));
        }
        Ok(Self::new(storages, config.failover.clone(), metrics))
    }

    fn virtual_storage(&self, name: &str) -> Result<&VirtualStorageState> {
        self.index
            .get(name)
            .map(|&i| &self.storages[i])
            .ok_or_else(|| Error::UnknownVirtualStorage(name.to_string()))
    }

    pub fn virtual_storages(&self) -> Vec<String> {
        self.storages.iter().map(|vs| vs.name.clone()).collect()
    }

    /// Healthy nodes, primary first, then configured order
    pub fn healthy_nodes(&self, virtual_storage: &str) -> Result<Vec<Node>> {
        let vs = self.virtual_storage(virtual_storage)?;
        let primary = vs.primary_index();
        let mut nodes = Vec::with_capacity(vs.nodes.len());
        if let Some(i) = primary.filter(|&i| vs.nodes[i].is_healthy()) {
            nodes.push(vs.nodes[i].node.clone());
        }
        nodes.extend(
            vs.nodes
                .iter()
                .enumerate()
                .filter(|(i, n)| Some(*i) != primary && n.is_healthy())
                .map(|(_, n)| n.node.clone()),
        );
        Ok(nodes)
    }

    pub fn primary_node(&self, virtual_storage: &str) -> Result<Node> {
        let vs = self.virtual_storage(virtual_storage)?;
        vs.primary_index()
            .map(|i| &vs.nodes[i])
            .filter(|n| n.is_healthy())
            .map(|n| n.node.clone())
            .ok_or_else(|| Error::NoHealthyPrimary(virtual_storage.to_string()))
    }

    /// Every configured node, healthy or not
    pub fn nodes(&self, virtual_storage: &str) -> Result<Vec<Node>> {
        let vs = self.virtual_storage(virtual_storage)?;
        Ok(vs.nodes.iter().map(|n| n.node.clone()).collect())
    }

    pub fn node(&self, virtual_storage: &str, storage: &str) -> Result<Node> {
        let vs = self.virtual_storage(virtual_storage)?;
        vs.nodes
            .iter()
            .find(|n| n.node.storage() == storage)
            .map(|n| n.node.clone())
            .ok_or_else(|| Error::UnknownStorage {
                virtual_storage: virtual_storage.to_string(),
                storage: storage.to_string(),
            })
    }

    pub fn is_healthy(&self, virtual_storage: &str, storage: &str) -> bool {
        self.virtual_storage(virtual_storage)
            .ok()
            .and_then(|vs| vs.nodes.iter().find(|n| n.node.storage() == storage))
            .is_some_and(NodeState::is_healthy)
    }

    /// Primary changes from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PrimaryChange> {
        self.events.subscribe()
    }

    pub fn status(&self) -> Vec<NodeHealth> {
        self.storages
            .iter()
            .flat_map(|vs| {
                let primary = vs.primary_index();
                vs.nodes.iter().enumerate().map(move |(i, n)| NodeHealth {
                    virtual_storage: vs.name.clone(),
                    storage: n.node.storage().to_string(),
                    address: n.node.config.address.clone(),
                    healthy: n.is_healthy(),
                    primary: primary == Some(i) && n.is_healthy(),
                    consecutive_failures: n.consecutive_failures.load(Ordering::Acquire),
                })
            })
            .collect()
    }

    /// True when every virtual storage has a primary
    pub fn is_ready(&self) -> bool {
        self.storages
            .iter()
            .all(|vs| self.primary_node(&vs.name).is_ok())
    }

    /// Probe every node once, concurrently, then re-elect primaries
    pub async fn probe_once(&self) {
        let timeout = self.config.probe_timeout();
        let probes = self.storages.iter().flat_map(|vs| {
            vs.nodes.iter().map(move |state| async move {
                let result = tokio::time::timeout(timeout, state.node.client.check(timeout))
                    .await
                    .unwrap_or_else(|_| Err(Error::Timeout("health probe".into())));
                (vs, state, result)
            })
        });

        for (vs, state, result) in futures_util::future::join_all(probes).await {
            if let Err(e) = &result {
                tracing::debug!(
                    virtual_storage = %vs.name,
                    node = %state.node.storage(),
                    error = %e,
                    "health probe failed"
                );
            }
            if let Some(healthy) = state.record(result.is_ok(), &self.config) {
                let to = if healthy { "healthy" } else { "unhealthy" };
                self.metrics
                    .health_transitions
                    .inc(&[vs.name.as_str(), state.node.storage(), to]);
                if healthy {
                    tracing::info!(virtual_storage = %vs.name, node = %state.node.storage(), "node is healthy again");
                } else {
                    tracing::warn!(virtual_storage = %vs.name, node = %state.node.storage(), "node marked unhealthy");
                }
            }
        }

        for vs in &self.storages {
            if let Some(change) = vs.elect() {
                tracing::warn!(
                    virtual_storage = %change.virtual_storage,
                    previous = ?change.previous,
                    current = ?change.current,
                    "primary changed"
                );
                // no subscribers is fine
                let _ = self.events.send(change);
            }
        }
    }

    /// Launch the probe loop
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut runner = match self.runner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if runner.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.probe_once().await,
                    _ = stop_rx.changed() => break,
                }
            }
            tracing::debug!("health probe loop stopped");
        });
        *runner = Some((stop_tx, handle));
    }

    /// Halt the probe loop and wait for it to finish
    pub async fn stop(&self) {
        let runner = match self.runner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((stop_tx, handle)) = runner {
            let _ = stop_tx.send(true);
            let _ = handle.await;
        }
    }
}
