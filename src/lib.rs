//! # repoward
//!
//! A replication-aware proxy in front of Git storage nodes. Nodes are
//! grouped into virtual storages; clients address a repository by virtual
//! storage and relative path and never see which physical copy serves them.
//!
//! - Reads go to any healthy node holding the latest generation
//! - Writes run as a transaction over the primary and its up to date
//!   secondaries and commit only if their votes agree
//! - Nodes that missed a write are caught up by a durable replication queue
//!
//! ## Architecture
//!
//! ```text
//!                 clients
//!                    │ HTTP
//!          ┌─────────▼──────────┐
//!          │       Router       │──── Transaction Manager
//!          │  (read / mutator)  │
//!          └──┬──────────────┬──┘
//!             │              │
//!   ┌─────────▼───┐   ┌──────▼───────────────┐
//!   │ Node health │   │ Consistent-storage   │◄── change feed
//!   │  + primary  │   │ cache                │
//!   └─────────┬───┘   └──────┬───────────────┘
//!             │              │
//!   ┌─────────▼──────────────▼───┐     ┌────────────────┐
//!   │ RocksDB: repositories,     │◄────│ Replicator     │
//!   │ replication queue          │     │ (background)   │
//!   └────────────────────────────┘     └───────┬────────┘
//!                                              │
//!   ┌──────────┐   ┌──────────┐   ┌──────────┐ │
//!   │ gitaly-1 │   │ gitaly-2 │   │ gitaly-3 │◄┘
//!   └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start the proxy
//! ```bash
//! repoward-proxy serve --config ./repoward.toml
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Back up every repository listed on stdin
//! repoward backup create --path ./backups --id 2024-01-01 < repositories.jsonl
//!
//! # Inspect a running proxy
//! repoward --proxy http://localhost:2305 nodes
//! repoward --proxy http://localhost:2305 jobs --virtual-storage default
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod datastore;
pub mod ops;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{Coordinator, Proxy};
pub use datastore::RocksDatastore;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
