//! Request path of the proxy
//!
//! - `node`: dialing physical storage nodes
//! - `health`: probing nodes and electing a primary per virtual storage
//! - `cache`: up to date storages per repository, invalidated by the change feed
//! - `transactions`: quorum voting over the participants of a write
//! - `rpc` and `router`: classifying and routing RPCs
//! - `replicator`: draining the replication queue
//! - `http` and `server`: the proxy API

pub mod cache;
pub mod health;
pub mod http;
pub mod node;
pub mod replicator;
pub mod router;
pub mod rpc;
pub mod server;
pub mod transactions;

pub use cache::ConsistentStoragesCache;
pub use health::{HealthManager, NodeHealth, PrimaryChange};
pub use node::{Dialer, HttpDialer, Node, NodeClient};
pub use replicator::Replicator;
pub use router::{Coordinator, RepositoryKey, RequestBody, RouteResponse};
pub use rpc::{classify, Rpc};
pub use server::Proxy;
pub use transactions::{Decision, TransactionHandle, TransactionManager, VoteOutcome, Voter};
