//! Batch backup pipeline

mod common;

use common::{node_config, FakeCluster};
use repoward::ops::{read_requests, BackupRequest, Pipeline};
use std::sync::Arc;
use tempfile::TempDir;

fn request(storage: &str, relative_path: &str) -> BackupRequest {
    let node = node_config(storage);
    BackupRequest {
        address: node.address,
        token: node.token,
        storage_name: node.storage,
        relative_path: relative_path.to_string(),
    }
}

fn repositories() -> Vec<String> {
    (0..5).map(|i| format!("@hashed/{:02}/repo-{}.git", i, i)).collect()
}

#[tokio::test]
async fn test_create_writes_one_bundle_per_repository() {
    let dir = TempDir::new().unwrap();
    let cluster = FakeCluster::new(&["gitaly-1"]);
    let pipeline = Pipeline::new(Arc::new(cluster), dir.path(), "20261019000000");

    let requests = repositories()
        .iter()
        .map(|rp| request("gitaly-1", rp))
        .collect();
    let summary = pipeline.create(requests).await.unwrap();

    assert_eq!(summary.bundles.len(), 5);
    for rp in repositories() {
        let bundle = dir.path().join(&rp).join("20261019000000").join("001.bundle");
        let content = std::fs::read_to_string(&bundle).unwrap();
        assert_eq!(content, format!("bundle:gitaly-1:{}", rp));
        assert!(!bundle.with_file_name("001.bundle.partial").exists());
    }
    let expected: u64 = repositories()
        .iter()
        .map(|rp| format!("bundle:gitaly-1:{}", rp).len() as u64)
        .sum();
    assert_eq!(summary.bytes, expected);
}

#[tokio::test]
async fn test_failed_repository_is_reported_and_others_complete() {
    let dir = TempDir::new().unwrap();
    let cluster = FakeCluster::new(&["gitaly-1"]);
    let pipeline = Pipeline::new(Arc::new(cluster), dir.path(), "backup-id").with_parallelism(2);

    let mut input = String::new();
    for rp in repositories() {
        input.push_str(&serde_json::to_string(&request("gitaly-1", &rp)).unwrap());
        input.push('\n');
    }
    input.push_str(
        r#"{"address":"invalid","token":"","storage_name":"default","relative_path":"invalid"}"#,
    );
    input.push('\n');
    let requests = read_requests(input.as_bytes()).unwrap();
    assert_eq!(requests.len(), 6);

    let err = pipeline.create(requests).await.unwrap_err();
    assert_eq!(
        format!("create: {}", err),
        "create: pipeline: 1 failures encountered:\n - invalid: could not dial source: invalid connection string: \"invalid\"\n"
    );
    for rp in repositories() {
        assert!(dir.path().join(&rp).join("backup-id").join("001.bundle").exists());
    }
    assert!(!dir.path().join("invalid").join("backup-id").join("001.bundle").exists());
}

#[tokio::test]
async fn test_relative_path_outside_root_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cluster = FakeCluster::new(&["gitaly-1"]);
    let pipeline = Pipeline::new(Arc::new(cluster), dir.path().join("backups"), "id");

    let err = pipeline
        .create(vec![request("gitaly-1", "../escape.git")])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("../escape.git"), "{}", err);
    assert!(!dir.path().join("escape.git").exists());
}
