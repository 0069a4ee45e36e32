//! Error types for repoward

use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Configuration Errors ===
    #[error("virtual storage {0:?} does not exist")]
    UnknownVirtualStorage(String),

    #[error("storage {storage:?} is not configured for virtual storage {virtual_storage:?}")]
    UnknownStorage {
        virtual_storage: String,
        storage: String,
    },

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Availability Errors ===
    #[error("no healthy primary for virtual storage {0:?}")]
    NoHealthyPrimary(String),

    #[error("no healthy up to date replica for {virtual_storage}/{relative_path}")]
    NoHealthyReplica {
        virtual_storage: String,
        relative_path: String,
    },

    #[error("primary {primary} is not up to date for {relative_path}")]
    PrimaryOutdated {
        primary: String,
        relative_path: String,
    },

    #[error("invalid connection string: {0:?}")]
    InvalidConnectionString(String),

    #[error("could not dial source: {0}")]
    Dial(Box<Error>),

    #[error("node {node}: {source}")]
    Node {
        node: String,
        #[source]
        source: Box<Error>,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("node responded with {status}: {message}")]
    NodeStatus { status: u16, message: String },

    // === Consistency Errors ===
    #[error("transaction {id} aborted: {reason}")]
    TransactionAborted { id: u64, reason: String },

    #[error("transaction {0} not found")]
    TransactionNotFound(u64),

    #[error("transaction {id}: {voter} is not a participant")]
    UnknownVoter { id: u64, voter: String },

    #[error("transaction {id}: {voter} already voted")]
    AlreadyVoted { id: u64, voter: String },

    // === Datastore Errors ===
    #[error("repository {virtual_storage}/{relative_path} not found")]
    RepositoryNotFound {
        virtual_storage: String,
        relative_path: String,
    },

    #[error("repository {virtual_storage}/{relative_path} already exists")]
    RepositoryExists {
        virtual_storage: String,
        relative_path: String,
    },

    #[error("replication job {0} not found")]
    JobNotFound(u64),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    Corrupted(String),

    // === Batch Errors ===
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap an error with the identity of the node it came from.
    pub fn on_node(self, node: impl Into<String>) -> Self {
        Error::Node {
            node: node.into(),
            source: Box::new(self),
        }
    }

    /// Like `on_node`, but leaves errors that already name a node alone.
    pub fn with_node(self, node: impl Into<String>) -> Self {
        match self {
            Error::Node { .. } => self,
            other => other.on_node(node),
        }
    }

    /// Strip node wrappers to get at the underlying cause.
    pub fn root(&self) -> &Error {
        match self {
            Error::Node { source, .. } => source.root(),
            other => other,
        }
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Error::Timeout(_)
                | Error::Http(_)
                | Error::NoHealthyPrimary(_)
                | Error::NoHealthyReplica { .. }
                | Error::PrimaryOutdated { .. }
        )
    }

    /// Convert to gRPC status for RPC responses
    pub fn to_grpc_status(&self) -> tonic::Status {
        use tonic::Code;
        let code = match self.root() {
            Error::UnknownVirtualStorage(_)
            | Error::UnknownStorage { .. }
            | Error::UnknownMethod(_)
            | Error::InvalidArgument(_)
            | Error::InvalidConfig(_)
            | Error::InvalidConnectionString(_) => Code::InvalidArgument,
            Error::NoHealthyPrimary(_)
            | Error::NoHealthyReplica { .. }
            | Error::PrimaryOutdated { .. }
            | Error::Dial(_)
            | Error::Http(_) => Code::Unavailable,
            Error::TransactionAborted { .. } | Error::AlreadyVoted { .. } => Code::Aborted,
            Error::RepositoryNotFound { .. }
            | Error::TransactionNotFound(_)
            | Error::JobNotFound(_) => Code::NotFound,
            Error::RepositoryExists { .. } => Code::AlreadyExists,
            Error::UnknownVoter { .. } => Code::PermissionDenied,
            Error::Timeout(_) => Code::DeadlineExceeded,
            _ => Code::Internal,
        };
        tonic::Status::new(code, self.to_string())
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.to_grpc_status().code() {
            tonic::Code::InvalidArgument => StatusCode::BAD_REQUEST,
            tonic::Code::NotFound => StatusCode::NOT_FOUND,
            tonic::Code::AlreadyExists | tonic::Code::Aborted => StatusCode::CONFLICT,
            tonic::Code::PermissionDenied => StatusCode::FORBIDDEN,
            tonic::Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            tonic::Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Every failure of a multi-target operation, in submission order.
#[derive(Debug, Default)]
pub struct AggregateError {
    pub operation: String,
    pub failures: Vec<(String, Error)>,
}

impl AggregateError {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, err: Error) {
        self.failures.push((name.into(), err));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// `Ok(())` when nothing failed, the aggregate otherwise.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} failures encountered:",
            self.operation,
            self.failures.len()
        )?;
        for (name, err) in &self.failures {
            writeln!(f, " - {}: {}", name, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Corrupted(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
