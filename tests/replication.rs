//! Replication worker and durable queue behavior

mod common;

use bytes::Bytes;
use common::{Harness, VIRTUAL_STORAGE};
use repoward::datastore::{JobState, ReplicationQueue, RepositoryStore};
use std::time::Duration;

const NODES: &[&str] = &["gitaly-1", "gitaly-2", "gitaly-3"];

/// Repository `a.git` where gitaly-3 missed one write
async fn lagging(h: &Harness) -> u64 {
    h.create("a.git").await.unwrap();
    h.set_healthy("gitaly-3", false).await;
    h.write("a.git", "v1").await.unwrap();
    h.set_healthy("gitaly-3", true).await;
    let jobs = h.datastore.list_jobs(VIRTUAL_STORAGE).await.unwrap();
    assert_eq!(jobs.len(), 1);
    jobs[0].id
}

#[tokio::test]
async fn test_retry_budget_exhausts() {
    let h = Harness::new(NODES);
    let id = lagging(&h).await;
    h.node("gitaly-3").fail_replications(10);

    for attempt in 1..=3u32 {
        assert_eq!(h.replicator.run_once().await, 1);
        let job = h.datastore.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.attempt, attempt);
    }

    let job = h.datastore.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.unwrap().contains("replication stream reset"));
    assert_eq!(h.replicator.run_once().await, 0);
    assert_eq!(
        h.metrics
            .replication_jobs
            .get(&[VIRTUAL_STORAGE, &JobState::Failed.to_string()]),
        1
    );
    assert_eq!(
        h.generations("a.git").await,
        vec![
            ("gitaly-1".to_string(), 1),
            ("gitaly-2".to_string(), 1),
            ("gitaly-3".to_string(), 0)
        ]
    );
}

#[tokio::test]
async fn test_retry_succeeds_within_budget() {
    let h = Harness::new(NODES);
    let id = lagging(&h).await;
    h.node("gitaly-3").fail_replications(1);

    h.replicate_all().await;

    let job = h.datastore.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempt, 2);
    let replica_path = h.replica_path("a.git").await;
    assert_eq!(h.node("gitaly-3").content(&replica_path), Some(Bytes::from("v1")));
}

#[tokio::test]
async fn test_newer_write_supersedes_pending_job() {
    let h = Harness::new(NODES);
    h.create("a.git").await.unwrap();
    h.set_healthy("gitaly-3", false).await;
    h.write("a.git", "v1").await.unwrap();
    h.write("a.git", "v2").await.unwrap();

    let jobs = h.datastore.list_jobs(VIRTUAL_STORAGE).await.unwrap();
    let states: Vec<(u64, JobState)> = jobs.iter().map(|j| (j.generation, j.state)).collect();
    assert!(states.contains(&(1, JobState::Cancelled)), "{:?}", states);
    assert!(states.contains(&(2, JobState::Ready)), "{:?}", states);

    h.set_healthy("gitaly-3", true).await;
    h.replicate_all().await;
    let replica_path = h.replica_path("a.git").await;
    assert_eq!(h.node("gitaly-3").content(&replica_path), Some(Bytes::from("v2")));
    assert_eq!(h.node("gitaly-3").replicated.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_job_for_current_target_is_skipped() {
    let h = Harness::new(NODES);
    let id = lagging(&h).await;

    // something else already brought gitaly-3 up to date
    h.datastore
        .set_generation(VIRTUAL_STORAGE, "a.git", "gitaly-3", 1)
        .await
        .unwrap();
    h.replicate_all().await;

    let job = h.datastore.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(h.node("gitaly-3").replicated.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_background_worker_drains_queue() {
    let h = Harness::new(NODES);
    let id = lagging(&h).await;

    h.replicator.start();
    let mut state = JobState::Ready;
    for _ in 0..100 {
        state = h.datastore.get_job(id).await.unwrap().unwrap().state;
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.replicator.stop().await;

    assert_eq!(state, JobState::Completed);
    let replica_path = h.replica_path("a.git").await;
    assert_eq!(h.node("gitaly-3").content(&replica_path), Some(Bytes::from("v1")));
}
