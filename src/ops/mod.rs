//! Batch operations run from the CLI

pub mod backup;

pub use backup::{read_requests, BackupRequest, BackupSummary, Pipeline};
