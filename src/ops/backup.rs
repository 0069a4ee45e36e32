//! Batch repository backups
//!
//! Reads one JSON request per line, snapshots every repository from the
//! node that holds it and writes `<root>/<relative_path>/<backup_id>/001.bundle`.
//! Targets run concurrently; every failure is collected and reported at the
//! end instead of stopping the batch.

use crate::common::{format_bytes, validate_relative_path, AggregateError, Error, NodeConfig, Result};
use crate::coordinator::node::Dialer;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// File name of the first bundle of a backup
pub const BUNDLE_NAME: &str = "001.bundle";

/// Default number of repositories backed up at once
pub const DEFAULT_PARALLELISM: usize = 4;

/// One repository to back up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub address: String,
    #[serde(default)]
    pub token: String,
    pub storage_name: String,
    pub relative_path: String,
}

/// Parse JSON lines; blank lines are skipped
pub fn read_requests(reader: impl BufRead) -> Result<Vec<BackupRequest>> {
    let mut requests = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request = serde_json::from_str(&line)
            .map_err(|e| Error::InvalidArgument(format!("line {}: {}", n + 1, e)))?;
        requests.push(request);
    }
    Ok(requests)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupSummary {
    pub bundles: Vec<PathBuf>,
    pub bytes: u64,
}

pub struct Pipeline {
    dialer: Arc<dyn Dialer>,
    root: PathBuf,
    backup_id: String,
    parallelism: usize,
}

impl Pipeline {
    pub fn new(dialer: Arc<dyn Dialer>, root: impl Into<PathBuf>, backup_id: impl Into<String>) -> Self {
        Self {
            dialer,
            root: root.into(),
            backup_id: backup_id.into(),
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Back up every request. Fails with an aggregate naming each failed
    /// repository, in request order.
    pub async fn create(&self, requests: Vec<BackupRequest>) -> Result<BackupSummary> {
        let results: Vec<(String, Result<(PathBuf, u64)>)> =
            futures_util::stream::iter(requests)
                .map(|request| async move {
                    let name = request.relative_path.clone();
                    (name, self.create_one(request).await)
                })
                .buffered(self.parallelism)
                .collect()
                .await;

        let mut summary = BackupSummary::default();
        let mut failures = AggregateError::new("pipeline");
        for (name, result) in results {
            match result {
                Ok((path, bytes)) => {
                    summary.bundles.push(path);
                    summary.bytes += bytes;
                }
                Err(e) => {
                    tracing::warn!(relative_path = %name, error = %e, "backup failed");
                    failures.push(name, e);
                }
            }
        }
        failures.into_result()?;

        tracing::info!(
            backup_id = %self.backup_id,
            repositories = summary.bundles.len(),
            size = %format_bytes(summary.bytes),
            "backup created"
        );
        Ok(summary)
    }

    async fn create_one(&self, request: BackupRequest) -> Result<(PathBuf, u64)> {
        validate_relative_path(&request.relative_path)?;
        let node = NodeConfig {
            storage: request.storage_name.clone(),
            address: request.address.clone(),
            token: request.token.clone(),
        };
        let client = self
            .dialer
            .dial(&node)
            .map_err(|e| Error::Dial(Box::new(e)))?;

        let dir = self.root.join(&request.relative_path).join(&self.backup_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(BUNDLE_NAME);
        let partial = dir.join(format!("{}.partial", BUNDLE_NAME));

        match write_snapshot(&partial, client.snapshot(&request.relative_path).await).await {
            Ok(bytes) => {
                tokio::fs::rename(&partial, &path).await?;
                tracing::debug!(
                    storage = %request.storage_name,
                    relative_path = %request.relative_path,
                    path = %path.display(),
                    "bundle written"
                );
                Ok((path, bytes))
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

async fn write_snapshot(
    path: &Path,
    snapshot: Result<crate::coordinator::node::ByteStream>,
) -> Result<u64> {
    let mut stream = snapshot?;
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}
