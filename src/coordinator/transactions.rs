//! Quorum voting for mutating RPCs
//!
//! A transaction is opened with a fixed set of voters. Voters that were
//! healthy when the transaction was opened are required; the others may
//! vote but never hold up the decision.
//!
//! ```text
//! open ──▶ voting ──all required voted, fingerprints equal──▶ committed
//!            │
//!            ├──fingerprint mismatch──────────────────────▶ aborted
//!            ├──deadline with required votes missing──────▶ aborted
//!            └──cancel / stop / handle dropped────────────▶ aborted
//! ```
//!
//! The first decision is final. Later votes, cancels and stops observe it.

use crate::common::{Error, MetricsRegistry, Result, TransactionConfig, Vote};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Final state of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Decision {
    Committed,
    Aborted(String),
}

impl Decision {
    pub fn is_committed(&self) -> bool {
        matches!(self, Decision::Committed)
    }

    fn label(&self) -> &'static str {
        match self {
            Decision::Committed => "committed",
            Decision::Aborted(_) => "aborted",
        }
    }
}

/// What one voter learns from its vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    Committed,
    Aborted(String),
    /// No decision within this voter's timeout; the voter must not apply.
    TimedOut,
}

impl From<Decision> for VoteOutcome {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Committed => VoteOutcome::Committed,
            Decision::Aborted(reason) => VoteOutcome::Aborted(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voter {
    pub name: String,
    pub required: bool,
}

impl Voter {
    pub fn new(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            required,
        }
    }
}

#[derive(Default)]
struct Ballot {
    votes: HashMap<String, Vote>,
    delivered: HashSet<String>,
}

struct Transaction {
    id: u64,
    virtual_storage: String,
    relative_path: String,
    voters: Vec<Voter>,
    ballot: Mutex<Ballot>,
    decision: watch::Sender<Option<Decision>>,
}

impl Transaction {
    fn ballot(&self) -> MutexGuard<'_, Ballot> {
        match self.ballot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn decided(&self) -> Option<Decision> {
        self.decision.borrow().clone()
    }

    /// Evaluate the ballot after a vote; `None` while still undecided
    fn evaluate(&self, ballot: &Ballot) -> Option<Decision> {
        let mut cast = ballot.votes.values();
        let first = cast.next()?;
        if cast.any(|v| v != first) {
            return Some(Decision::Aborted("vote mismatch".into()));
        }
        let missing = self
            .voters
            .iter()
            .any(|v| v.required && !ballot.votes.contains_key(&v.name));
        if missing {
            None
        } else {
            Some(Decision::Committed)
        }
    }

    fn missing_voters(&self) -> Vec<String> {
        let ballot = self.ballot();
        self.voters
            .iter()
            .filter(|v| v.required && !ballot.votes.contains_key(&v.name))
            .map(|v| v.name.clone())
            .collect()
    }
}

/// Registry state shared with background deadline tasks
struct Registry {
    transactions: DashMap<u64, Arc<Transaction>>,
    metrics: Arc<MetricsRegistry>,
}

impl Registry {
    /// Record `decision` unless one exists; returns the recorded decision
    fn decide(&self, tx: &Transaction, decision: Decision) -> Decision {
        let mut recorded = None;
        tx.decision.send_if_modified(|current| match current {
            Some(existing) => {
                recorded = Some(existing.clone());
                false
            }
            None => {
                *current = Some(decision.clone());
                true
            }
        });

        match recorded {
            Some(existing) => existing,
            None => {
                self.metrics.transactions.inc(&[decision.label()]);
                match &decision {
                    Decision::Committed => tracing::debug!(
                        transaction_id = tx.id,
                        virtual_storage = %tx.virtual_storage,
                        relative_path = %tx.relative_path,
                        "transaction committed"
                    ),
                    Decision::Aborted(reason) => tracing::info!(
                        transaction_id = tx.id,
                        virtual_storage = %tx.virtual_storage,
                        relative_path = %tx.relative_path,
                        reason = %reason,
                        "transaction aborted"
                    ),
                }
                decision
            }
        }
    }
}

/// Snapshot of a live transaction
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub id: u64,
    pub virtual_storage: String,
    pub relative_path: String,
    pub voters: Vec<String>,
    pub decision: Option<Decision>,
}

pub struct TransactionManager {
    registry: Arc<Registry>,
    next_id: AtomicU64,
    config: TransactionConfig,
}

impl TransactionManager {
    pub fn new(config: TransactionConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            registry: Arc::new(Registry {
                transactions: DashMap::new(),
                metrics,
            }),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Open a transaction. Must be called inside a tokio runtime: a
    /// background task enforces the vote deadline and the cleanup guard.
    pub fn open(
        &self,
        virtual_storage: &str,
        relative_path: &str,
        voters: Vec<Voter>,
    ) -> Result<TransactionHandle> {
        if voters.is_empty() {
            return Err(Error::InvalidArgument("transaction without voters".into()));
        }
        let mut names = HashSet::new();
        if let Some(dup) = voters.iter().find(|v| !names.insert(v.name.as_str())) {
            return Err(Error::InvalidArgument(format!(
                "voter {} listed twice",
                dup.name
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (decision, receiver) = watch::channel(None);
        let tx = Arc::new(Transaction {
            id,
            virtual_storage: virtual_storage.to_string(),
            relative_path: relative_path.to_string(),
            voters,
            ballot: Mutex::new(Ballot::default()),
            decision,
        });
        self.registry.transactions.insert(id, tx.clone());

        let registry = self.registry.clone();
        let vote_timeout = self.config.vote_timeout();
        let cleanup_grace = self.config.cleanup_grace();
        tokio::spawn(async move {
            tokio::time::sleep(vote_timeout).await;
            if tx.decided().is_none() {
                let missing = tx.missing_voters();
                registry.decide(
                    &tx,
                    Decision::Aborted(format!("timed out waiting for votes from {:?}", missing)),
                );
            }
            tokio::time::sleep(cleanup_grace).await;
            registry.transactions.remove(&tx.id);
        });

        tracing::debug!(
            transaction_id = id,
            virtual_storage = %virtual_storage,
            relative_path = %relative_path,
            "transaction opened"
        );

        Ok(TransactionHandle {
            id,
            receiver,
            registry: self.registry.clone(),
            armed: true,
        })
    }

    fn get(&self, id: u64) -> Result<Arc<Transaction>> {
        self.registry
            .transactions
            .get(&id)
            .map(|tx| tx.value().clone())
            .ok_or(Error::TransactionNotFound(id))
    }

    /// Cast `voter`'s vote and wait for the decision
    pub async fn vote(&self, id: u64, voter: &str, vote: Vote) -> Result<VoteOutcome> {
        let tx = self.get(id)?;
        if !tx.voters.iter().any(|v| v.name == voter) {
            return Err(Error::UnknownVoter {
                id,
                voter: voter.to_string(),
            });
        }

        let verdict = {
            let mut ballot = tx.ballot();
            if ballot.votes.contains_key(voter) {
                return Err(Error::AlreadyVoted {
                    id,
                    voter: voter.to_string(),
                });
            }
            if tx.decided().is_none() {
                ballot.votes.insert(voter.to_string(), vote);
                tx.evaluate(&ballot)
            } else {
                None
            }
        };
        if let Some(decision) = verdict {
            self.registry.decide(&tx, decision);
        }

        let mut receiver = tx.decision.subscribe();
        let waited = tokio::time::timeout(
            self.config.vote_timeout(),
            receiver.wait_for(Option::is_some),
        )
        .await;
        let outcome = match waited {
            Ok(Ok(decision)) => match decision.clone() {
                Some(decision) => VoteOutcome::from(decision),
                None => VoteOutcome::TimedOut,
            },
            Ok(Err(_)) => VoteOutcome::Aborted("transaction dropped".into()),
            Err(_) => {
                tracing::warn!(transaction_id = id, voter = %voter, "vote timed out");
                VoteOutcome::TimedOut
            }
        };

        self.delivered(&tx, voter);
        Ok(outcome)
    }

    fn delivered(&self, tx: &Transaction, voter: &str) {
        let all = {
            let mut ballot = tx.ballot();
            ballot.delivered.insert(voter.to_string());
            ballot.delivered.len() == tx.voters.len()
        };
        if all {
            self.registry.transactions.remove(&tx.id);
        }
    }

    /// Abort unless already decided; returns the recorded decision
    pub fn cancel(&self, id: u64, reason: &str) -> Result<Decision> {
        let tx = self.get(id)?;
        Ok(self
            .registry
            .decide(&tx, Decision::Aborted(reason.to_string())))
    }

    /// Externally requested stop
    pub fn stop(&self, id: u64) -> Result<Decision> {
        self.cancel(id, "transaction stopped")
    }

    pub fn decision(&self, id: u64) -> Option<Decision> {
        self.registry
            .transactions
            .get(&id)
            .and_then(|tx| tx.decided())
    }

    pub fn list(&self) -> Vec<TransactionInfo> {
        let mut list: Vec<TransactionInfo> = self
            .registry
            .transactions
            .iter()
            .map(|entry| {
                let tx = entry.value();
                TransactionInfo {
                    id: tx.id,
                    virtual_storage: tx.virtual_storage.clone(),
                    relative_path: tx.relative_path.clone(),
                    voters: tx.voters.iter().map(|v| v.name.clone()).collect(),
                    decision: tx.decided(),
                }
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    pub fn len(&self) -> usize {
        self.registry.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.transactions.is_empty()
    }
}

/// Owner's view of a transaction. Dropping it before a decision aborts the
/// transaction, so a cancelled request never leaves voters hanging.
pub struct TransactionHandle {
    id: u64,
    receiver: watch::Receiver<Option<Decision>>,
    registry: Arc<Registry>,
    armed: bool,
}

impl TransactionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the decision
    pub async fn decision(&mut self) -> Decision {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(decision) => decision
                .clone()
                .unwrap_or_else(|| Decision::Aborted("undecided".into())),
            Err(_) => Decision::Aborted("transaction dropped".into()),
        }
    }

    pub fn cancel(&self, reason: &str) -> Decision {
        match self.registry.transactions.get(&self.id) {
            Some(tx) => self
                .registry
                .decide(tx.value(), Decision::Aborted(reason.to_string())),
            None => self
                .receiver
                .borrow()
                .clone()
                .unwrap_or_else(|| Decision::Aborted(reason.to_string())),
        }
    }

    /// Stop aborting on drop
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.armed && self.receiver.borrow().is_none() {
            tracing::debug!(transaction_id = self.id, "transaction owner went away");
            self.cancel("cancelled");
        }
    }
}
