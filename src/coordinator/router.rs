//! Request routing
//!
//! Accessors go to the least loaded healthy node that holds the latest
//! generation. Mutators go through a transaction:
//!
//! 1. resolve the primary, failing fast when there is none
//! 2. open a transaction over the primary and its up to date secondaries
//! 3. prepare on every participant and collect their votes
//! 4. on commit, bump the generation of the storages that applied the
//!    change and queue replication jobs for every other storage
//! 5. on abort, return the reason; nothing was applied
//!
//! Dropping a `route` future before the decision aborts its transaction.
//! Participant work and everything after the decision run in spawned tasks,
//! so prepared changes are always committed or aborted on the nodes and a
//! committed change always bumps generations and queues its jobs.

use crate::common::{
    validate_relative_path, AggregateError, Error, MetricsRegistry, ReplicationPolicy, Result,
    Vote,
};
use crate::coordinator::cache::ConsistentStoragesCache;
use crate::coordinator::health::HealthManager;
use crate::coordinator::node::{ByteStream, Node};
use crate::coordinator::rpc::{classify, Rpc};
use crate::coordinator::transactions::{Decision, TransactionManager, VoteOutcome, Voter};
use crate::datastore::queue::{ChangeType, NewJob, ReplicationQueue};
use crate::datastore::repositories::{ConsistentStoragesGetter, RepositoryStore};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Logical repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryKey {
    pub virtual_storage: String,
    pub relative_path: String,
}

impl RepositoryKey {
    pub fn new(virtual_storage: impl Into<String>, relative_path: impl Into<String>) -> Self {
        Self {
            virtual_storage: virtual_storage.into(),
            relative_path: relative_path.into(),
        }
    }
}

impl fmt::Display for RepositoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.virtual_storage, self.relative_path)
    }
}

pub enum RouteResponse {
    Unary(Bytes),
    Stream(ByteStream),
}

impl fmt::Debug for RouteResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteResponse::Unary(body) => f.debug_tuple("Unary").field(&body.len()).finish(),
            RouteResponse::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl RouteResponse {
    /// Collect the whole response
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            RouteResponse::Unary(body) => Ok(body),
            RouteResponse::Stream(stream) => collect(stream).await,
        }
    }
}

/// Request payload of a routed RPC
pub enum RequestBody {
    Buffered(Bytes),
    /// Passed through chunk by chunk to streaming accessors, collected for
    /// everything else
    Stream(ByteStream),
}

impl From<Bytes> for RequestBody {
    fn from(body: Bytes) -> Self {
        RequestBody::Buffered(body)
    }
}

impl RequestBody {
    async fn into_bytes(self) -> Result<Bytes> {
        match self {
            RequestBody::Buffered(body) => Ok(body),
            RequestBody::Stream(stream) => collect(stream).await,
        }
    }

    fn into_stream(self) -> ByteStream {
        match self {
            RequestBody::Buffered(body) => Box::pin(futures_util::stream::once(async move { Ok(body) })),
            RequestBody::Stream(stream) => stream,
        }
    }
}

async fn collect(mut stream: ByteStream) -> Result<Bytes> {
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(body))
}

/// What happened on one participant
#[derive(Debug)]
enum Participation {
    /// Committed on the node, with its response
    Applied(Bytes),
    /// Voted for the committed result; data follows via replication
    Accepted,
    /// Did not apply
    NotApplied,
    Failed(Error),
}

/// Decrements a node's in-flight counter when the request is done
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn acquire(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Coordinator {
    health: Arc<HealthManager>,
    cache: Arc<ConsistentStoragesCache>,
    store: Arc<dyn RepositoryStore>,
    queue: Arc<dyn ReplicationQueue>,
    transactions: Arc<TransactionManager>,
    policy: ReplicationPolicy,
    metrics: Arc<MetricsRegistry>,
    in_flight: DashMap<(String, String), Arc<AtomicUsize>>,
}

impl Coordinator {
    pub fn new(
        health: Arc<HealthManager>,
        cache: Arc<ConsistentStoragesCache>,
        store: Arc<dyn RepositoryStore>,
        queue: Arc<dyn ReplicationQueue>,
        transactions: Arc<TransactionManager>,
        policy: ReplicationPolicy,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            health,
            cache,
            store,
            queue,
            transactions,
            policy,
            metrics,
            in_flight: DashMap::new(),
        }
    }

    pub fn health(&self) -> &Arc<HealthManager> {
        &self.health
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    /// Route one RPC
    pub async fn route(
        &self,
        method: &str,
        key: &RepositoryKey,
        payload: impl Into<RequestBody>,
    ) -> Result<RouteResponse> {
        let start = Instant::now();
        let result = self.dispatch(method, key, payload.into()).await;
        self.metrics
            .observe_rpc(method, start.elapsed(), result.is_ok());
        if let Err(e) = &result {
            tracing::debug!(method = %method, repository = %key, error = %e, "route failed");
        }
        result
    }

    async fn dispatch(
        &self,
        method: &str,
        key: &RepositoryKey,
        payload: RequestBody,
    ) -> Result<RouteResponse> {
        let rpc = classify(method)?;
        validate_relative_path(&key.relative_path)?;

        match rpc {
            Rpc::Accessor { method, streaming } => {
                self.route_accessor(method, streaming, key, payload).await
            }
            Rpc::Mutator { method, change } => {
                let payload = payload.into_bytes().await?;
                self.route_mutator(method, change, key, payload)
                    .await
                    .map(RouteResponse::Unary)
            }
        }
    }

    fn counter(&self, node: &Node) -> Arc<AtomicUsize> {
        self.in_flight
            .entry((node.virtual_storage.clone(), node.storage().to_string()))
            .or_default()
            .clone()
    }

    /// Least loaded node, ties broken at random
    fn pick(&self, candidates: Vec<Node>) -> Option<Node> {
        let loads: Vec<usize> = candidates
            .iter()
            .map(|n| self.counter(n).load(Ordering::Acquire))
            .collect();
        let min = loads.iter().copied().min()?;
        let least: Vec<Node> = candidates
            .into_iter()
            .zip(loads)
            .filter(|(_, load)| *load == min)
            .map(|(n, _)| n)
            .collect();
        least.choose(&mut rand::thread_rng()).cloned()
    }

    async fn route_accessor(
        &self,
        method: &'static str,
        streaming: bool,
        key: &RepositoryKey,
        payload: RequestBody,
    ) -> Result<RouteResponse> {
        let healthy = self.health.healthy_nodes(&key.virtual_storage)?;
        let consistent = self
            .cache
            .get_consistent_storages(&key.virtual_storage, &key.relative_path)
            .await?;

        let candidates: Vec<Node> = healthy
            .into_iter()
            .filter(|n| consistent.storages.contains(n.storage()))
            .collect();
        let node = self.pick(candidates).ok_or_else(|| Error::NoHealthyReplica {
            virtual_storage: key.virtual_storage.clone(),
            relative_path: key.relative_path.clone(),
        })?;

        tracing::debug!(
            method = %method,
            repository = %key,
            node = %node.storage(),
            "routing accessor"
        );

        let guard = InFlight::acquire(self.counter(&node));
        if streaming {
            let mut upstream = node
                .client
                .call_stream(method, &consistent.replica_path, payload.into_stream())
                .await
                .map_err(|e| e.with_node(node.storage()))?;
            let stream = async_stream::stream! {
                let _guard = guard;
                while let Some(chunk) = upstream.next().await {
                    yield chunk;
                }
            };
            Ok(RouteResponse::Stream(Box::pin(stream)))
        } else {
            let payload = payload.into_bytes().await?;
            let body = node
                .client
                .call(method, &consistent.replica_path, payload)
                .await
                .map_err(|e| e.with_node(node.storage()))?;
            drop(guard);
            Ok(RouteResponse::Unary(body))
        }
    }

    async fn route_mutator(
        &self,
        method: &'static str,
        change: ChangeType,
        key: &RepositoryKey,
        payload: Bytes,
    ) -> Result<Bytes> {
        let primary = self.health.primary_node(&key.virtual_storage)?;
        match change {
            ChangeType::Create => self.create(method, key, primary, payload).await,
            ChangeType::Update => self.update(method, key, primary, payload).await,
            ChangeType::Delete => self.remove(method, key, primary, payload).await,
        }
    }

    async fn update(
        &self,
        method: &'static str,
        key: &RepositoryKey,
        primary: Node,
        payload: Bytes,
    ) -> Result<Bytes> {
        let consistent = self
            .cache
            .get_consistent_storages(&key.virtual_storage, &key.relative_path)
            .await?;
        if !consistent.storages.contains(primary.storage()) {
            return Err(Error::PrimaryOutdated {
                primary: primary.storage().to_string(),
                relative_path: key.relative_path.clone(),
            });
        }

        let participants = self.participants(key, &primary, |n| {
            consistent.storages.contains(n.storage())
        })?;
        let replica_path = consistent.replica_path;
        let finish = {
            let key = key.clone();
            let replica_path = replica_path.clone();
            move |ledger: Ledger, outcome: Result<Vec<(Node, Participation)>>| async move {
                let (updated, response) = ledger.applied(&key, &primary, outcome?)?;
                let generation = ledger
                    .store
                    .increment_generation(&key.virtual_storage, &key.relative_path, &updated)
                    .await?;
                ledger.cache.invalidate(&key.virtual_storage, &key.relative_path);
                ledger
                    .schedule(
                        &key,
                        &replica_path,
                        &primary,
                        &updated,
                        ChangeType::Update,
                        generation,
                    )
                    .await;
                response
            }
        };
        self.execute(key, method, &replica_path, payload, participants, finish)
            .await
    }

    async fn create(
        &self,
        method: &'static str,
        key: &RepositoryKey,
        primary: Node,
        payload: Bytes,
    ) -> Result<Bytes> {
        // A record without replicas is left over from an aborted create.
        let record = match self
            .store
            .get_repository(&key.virtual_storage, &key.relative_path)
            .await?
        {
            Some(record) if !record.generations.is_empty() => {
                return Err(Error::RepositoryExists {
                    virtual_storage: key.virtual_storage.clone(),
                    relative_path: key.relative_path.clone(),
                })
            }
            Some(record) => record,
            None => {
                self.store
                    .create_repository(&key.virtual_storage, &key.relative_path, &[])
                    .await?
            }
        };

        let participants = self.participants(key, &primary, |_| true)?;
        let replica_path = record.replica_path;
        let finish = {
            let key = key.clone();
            let replica_path = replica_path.clone();
            move |ledger: Ledger, outcome: Result<Vec<(Node, Participation)>>| async move {
                let applied = outcome.and_then(|results| ledger.applied(&key, &primary, results));
                let (updated, response) = match applied {
                    Ok(applied) => applied,
                    Err(e) => {
                        ledger.forget(&key).await;
                        return Err(e);
                    }
                };
                let generation = ledger
                    .store
                    .increment_generation(&key.virtual_storage, &key.relative_path, &updated)
                    .await?;
                ledger.cache.invalidate(&key.virtual_storage, &key.relative_path);
                ledger
                    .schedule(
                        &key,
                        &replica_path,
                        &primary,
                        &updated,
                        ChangeType::Create,
                        generation,
                    )
                    .await;
                response
            }
        };
        self.execute(key, method, &replica_path, payload, participants, finish)
            .await
    }

    async fn remove(
        &self,
        method: &'static str,
        key: &RepositoryKey,
        primary: Node,
        payload: Bytes,
    ) -> Result<Bytes> {
        let record = self
            .store
            .get_repository(&key.virtual_storage, &key.relative_path)
            .await?
            .ok_or_else(|| Error::RepositoryNotFound {
                virtual_storage: key.virtual_storage.clone(),
                relative_path: key.relative_path.clone(),
            })?;

        let participants = self.participants(key, &primary, |n| {
            record.generations.contains_key(n.storage())
        })?;
        let replica_path = record.replica_path.clone();
        let finish = {
            let key = key.clone();
            move |ledger: Ledger, outcome: Result<Vec<(Node, Participation)>>| async move {
                let (removed, response) = ledger.applied(&key, &primary, outcome?)?;
                ledger
                    .store
                    .delete_repository(&key.virtual_storage, &key.relative_path)
                    .await?;
                ledger.cache.invalidate(&key.virtual_storage, &key.relative_path);

                // replicas left behind are removed in the background
                let leftover: Vec<String> = record
                    .generations
                    .keys()
                    .filter(|s| !removed.contains(*s))
                    .cloned()
                    .collect();
                let generation = record.max_generation().map_or(0, |g| g + 1);
                for target in leftover {
                    ledger
                        .enqueue(NewJob {
                            virtual_storage: key.virtual_storage.clone(),
                            relative_path: key.relative_path.clone(),
                            replica_path: record.replica_path.clone(),
                            source_storage: primary.storage().to_string(),
                            target_storage: target,
                            change: ChangeType::Delete,
                            generation,
                        })
                        .await;
                }
                response
            }
        };
        self.execute(key, method, &replica_path, payload, participants, finish)
            .await
    }

    /// Primary plus the secondaries selected by `eligible`, primary first.
    /// Each is required iff it is healthy now.
    fn participants(
        &self,
        key: &RepositoryKey,
        primary: &Node,
        eligible: impl Fn(&Node) -> bool,
    ) -> Result<Vec<(Node, bool)>> {
        let mut participants = vec![(primary.clone(), true)];
        for node in self.health.nodes(&key.virtual_storage)? {
            if node.storage() == primary.storage() || !eligible(&node) {
                continue;
            }
            let healthy = self.health.is_healthy(&key.virtual_storage, node.storage());
            participants.push((node, healthy));
        }
        Ok(participants)
    }

    fn ledger(&self) -> Ledger {
        Ledger {
            health: self.health.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            queue: self.queue.clone(),
        }
    }

    /// Run the transaction and hand its outcome to `finish`: the
    /// per-participant results when it committed, `TransactionAborted`
    /// otherwise.
    ///
    /// Dropping this future before the decision aborts the transaction.
    /// After the decision `finish` runs in its own task and completes even
    /// if nobody waits for it.
    async fn execute<F, Fut>(
        &self,
        key: &RepositoryKey,
        method: &'static str,
        replica_path: &str,
        payload: Bytes,
        participants: Vec<(Node, bool)>,
        finish: F,
    ) -> Result<Bytes>
    where
        F: FnOnce(Ledger, Result<Vec<(Node, Participation)>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        let voters = participants
            .iter()
            .map(|(node, required)| Voter::new(node.storage(), *required))
            .collect();
        let mut handle = match self
            .transactions
            .open(&key.virtual_storage, &key.relative_path, voters)
        {
            Ok(handle) => handle,
            Err(e) => return finish(self.ledger(), Err(e)).await,
        };
        let id = handle.id();

        // only healthy participants are contacted
        let active: Vec<Node> = participants
            .into_iter()
            .filter(|(_, required)| *required)
            .map(|(node, _)| node)
            .collect();

        tracing::debug!(
            transaction_id = id,
            repository = %key,
            method = %method,
            participants = ?active.iter().map(Node::storage).collect::<Vec<_>>(),
            policy = ?self.policy,
            "executing mutator"
        );

        let tasks = match self.policy {
            ReplicationPolicy::Sync => active
                .iter()
                .map(|node| {
                    let work = participate(
                        self.transactions.clone(),
                        node.clone(),
                        id,
                        method,
                        replica_path.to_string(),
                        payload.clone(),
                        None,
                    );
                    (node.clone(), tokio::spawn(work))
                })
                .collect::<Vec<_>>(),
            ReplicationPolicy::Async => {
                let (fingerprint_tx, fingerprint_rx) = watch::channel(None);
                let mut nodes = active.iter();
                let mut tasks = Vec::with_capacity(active.len());
                if let Some(leader) = nodes.next() {
                    let work = participate(
                        self.transactions.clone(),
                        leader.clone(),
                        id,
                        method,
                        replica_path.to_string(),
                        payload.clone(),
                        Some(fingerprint_tx),
                    );
                    tasks.push((leader.clone(), tokio::spawn(work)));
                }
                for node in nodes {
                    let work = echo(
                        self.transactions.clone(),
                        node.storage().to_string(),
                        id,
                        fingerprint_rx.clone(),
                    );
                    tasks.push((node.clone(), tokio::spawn(work)));
                }
                tasks
            }
        };

        let decision = handle.decision().await;
        handle.disarm();

        let ledger = self.ledger();
        let finalize = tokio::spawn(async move {
            let mut results = Vec::with_capacity(tasks.len());
            for (node, task) in tasks {
                let participation = task.await.unwrap_or_else(|e| {
                    Participation::Failed(Error::Internal(format!(
                        "participant task failed: {}",
                        e
                    )))
                });
                results.push((node, participation));
            }
            drop(handle);

            let outcome = match decision {
                Decision::Committed => Ok(results),
                Decision::Aborted(reason) => {
                    let mut failures = AggregateError::new(format!("transaction {}", id));
                    for (node, participation) in results {
                        if let Participation::Failed(e) = participation {
                            failures.push(node.storage(), e);
                        }
                    }
                    let reason = if failures.is_empty() {
                        reason
                    } else {
                        format!("{}: {}", reason, failures.to_string().trim_end())
                    };
                    Err(Error::TransactionAborted { id, reason })
                }
            };
            finish(ledger, outcome).await
        });
        finalize
            .await
            .unwrap_or_else(|e| Err(Error::Internal(format!("finalize task failed: {}", e))))
    }
}

/// Store, cache and queue updates that follow a decided transaction
#[derive(Clone)]
struct Ledger {
    health: Arc<HealthManager>,
    cache: Arc<ConsistentStoragesCache>,
    store: Arc<dyn RepositoryStore>,
    queue: Arc<dyn ReplicationQueue>,
}

impl Ledger {
    /// Drop the record of a repository whose creation failed
    async fn forget(&self, key: &RepositoryKey) {
        if let Err(e) = self
            .store
            .delete_repository(&key.virtual_storage, &key.relative_path)
            .await
        {
            tracing::warn!(repository = %key, error = %e, "failed to roll back repository record");
        }
    }

    /// Storages that applied a committed change, and the response to return.
    ///
    /// The primary's response wins; if the primary failed after the commit
    /// decision, every failure is reported.
    fn applied(
        &self,
        key: &RepositoryKey,
        primary: &Node,
        results: Vec<(Node, Participation)>,
    ) -> Result<(Vec<String>, Result<Bytes>)> {
        let mut updated = Vec::new();
        let mut response = None;
        let mut first_applied = None;
        let mut failures = AggregateError::new(key.to_string());

        for (node, participation) in results {
            match participation {
                Participation::Applied(body) => {
                    if node.storage() == primary.storage() {
                        response = Some(body);
                    } else if first_applied.is_none() {
                        first_applied = Some(body);
                    }
                    updated.push(node.storage().to_string());
                }
                Participation::Accepted => {}
                Participation::NotApplied => {}
                Participation::Failed(e) => {
                    tracing::warn!(repository = %key, node = %node.storage(), error = %e, "participant failed after commit");
                    failures.push(node.storage(), e);
                }
            }
        }

        if updated.is_empty() {
            return Err(failures
                .into_result()
                .err()
                .unwrap_or_else(|| Error::Internal("committed but nothing was applied".into())));
        }
        let response = match response {
            Some(body) => Ok(body),
            None if failures.is_empty() => first_applied
                .ok_or_else(|| Error::Internal("missing response".into())),
            None => Err(Error::Aggregate(failures)),
        };
        Ok((updated, response))
    }

    /// Queue jobs for every configured storage that did not apply the change
    async fn schedule(
        &self,
        key: &RepositoryKey,
        replica_path: &str,
        primary: &Node,
        updated: &[String],
        change: ChangeType,
        generation: u64,
    ) {
        let source = if updated.iter().any(|s| s == primary.storage()) {
            primary.storage().to_string()
        } else {
            match updated.first() {
                Some(storage) => storage.clone(),
                None => return,
            }
        };
        let updated: HashSet<&str> = updated.iter().map(String::as_str).collect();

        let nodes = match self.health.nodes(&key.virtual_storage) {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!(repository = %key, error = %e, "cannot schedule replication");
                return;
            }
        };
        for node in nodes {
            if updated.contains(node.storage()) {
                continue;
            }
            self.enqueue(NewJob {
                virtual_storage: key.virtual_storage.clone(),
                relative_path: key.relative_path.clone(),
                replica_path: replica_path.to_string(),
                source_storage: source.clone(),
                target_storage: node.storage().to_string(),
                change,
                generation,
            })
            .await;
        }
    }

    /// The write already happened; a lost job is logged, not returned.
    async fn enqueue(&self, job: NewJob) {
        let target = job.target_storage.clone();
        match self.queue.enqueue(job).await {
            Ok(job) => tracing::debug!(
                job_id = job.id,
                virtual_storage = %job.virtual_storage,
                relative_path = %job.relative_path,
                target_storage = %target,
                generation = job.generation,
                "replication job queued"
            ),
            Err(e) => tracing::error!(target_storage = %target, error = %e, "failed to queue replication job"),
        }
    }
}

/// Prepare, vote, then commit or abort on one node
async fn participate(
    transactions: Arc<TransactionManager>,
    node: Node,
    id: u64,
    method: &'static str,
    replica_path: String,
    payload: Bytes,
    publish: Option<watch::Sender<Option<Vote>>>,
) -> Participation {
    let storage = node.storage().to_string();
    let vote = match node.client.prepare(id, method, &replica_path, payload).await {
        Ok(vote) => vote,
        Err(e) => {
            let e = e.with_node(&storage);
            let _ = transactions.cancel(id, &format!("{} failed to prepare", storage));
            if let Err(abort) = node.client.abort(id).await {
                tracing::debug!(transaction_id = id, node = %storage, error = %abort, "abort after failed prepare");
            }
            return Participation::Failed(e);
        }
    };
    if let Some(publish) = publish {
        let _ = publish.send(Some(vote.clone()));
    }

    match transactions.vote(id, &storage, vote).await {
        Ok(VoteOutcome::Committed) => match node.client.commit(id).await {
            Ok(body) => Participation::Applied(body),
            Err(e) => Participation::Failed(e.with_node(&storage)),
        },
        Ok(outcome) => {
            tracing::debug!(transaction_id = id, node = %storage, outcome = ?outcome, "not applying");
            match node.client.abort(id).await {
                Ok(()) => Participation::NotApplied,
                Err(e) => Participation::Failed(e.with_node(&storage)),
            }
        }
        Err(e) => {
            let _ = node.client.abort(id).await;
            Participation::Failed(e.with_node(&storage))
        }
    }
}

/// Vote the leader's fingerprint on behalf of a secondary
async fn echo(
    transactions: Arc<TransactionManager>,
    storage: String,
    id: u64,
    mut fingerprint: watch::Receiver<Option<Vote>>,
) -> Participation {
    let vote = match fingerprint.wait_for(Option::is_some).await {
        Ok(vote) => vote.clone(),
        // leader never prepared
        Err(_) => return Participation::NotApplied,
    };
    let Some(vote) = vote else {
        return Participation::NotApplied;
    };
    match transactions.vote(id, &storage, vote).await {
        Ok(VoteOutcome::Committed) => Participation::Accepted,
        Ok(_) => Participation::NotApplied,
        Err(e) => Participation::Failed(e.with_node(&storage)),
    }
}
