//! Up to date storages cache as seen through routed reads

mod common;

use common::{Harness, VIRTUAL_STORAGE};
use repoward::datastore::{FeedEvent, Notification};
use std::sync::atomic::Ordering;

const NODES: &[&str] = &["gitaly-1", "gitaly-2", "gitaly-3"];

fn cache_count(h: &Harness, kind: &str) -> u64 {
    h.metrics.cache_access.get(&[VIRTUAL_STORAGE, kind])
}

#[tokio::test]
async fn test_repeated_reads_are_served_from_cache() {
    let h = Harness::new(NODES);
    h.create("a.git").await.unwrap();
    h.settle().await;

    for _ in 0..3 {
        h.read("a.git").await.unwrap();
    }

    assert_eq!(cache_count(&h, "miss"), 1);
    assert_eq!(cache_count(&h, "populate"), 1);
    assert_eq!(cache_count(&h, "hit"), 2);
    assert_eq!(h.cache.len(VIRTUAL_STORAGE), 1);
}

#[tokio::test]
async fn test_replication_invalidates_through_feed() {
    let h = Harness::new(NODES);
    h.create("a.git").await.unwrap();
    h.set_healthy("gitaly-3", false).await;
    h.write("a.git", "v1").await.unwrap();
    h.set_healthy("gitaly-3", true).await;
    h.settle().await;

    // cached answer excludes the lagging node
    h.read("a.git").await.unwrap();
    assert_eq!(h.cache.len(VIRTUAL_STORAGE), 1);

    h.replicate_all().await;
    h.settle().await;
    assert_eq!(h.cache.len(VIRTUAL_STORAGE), 0);
    assert!(cache_count(&h, "invalidate") >= 1);

    for _ in 0..50 {
        let body = h.read("a.git").await.unwrap();
        assert!(body.ends_with(b":v1"), "{:?}", body);
    }
    assert!(h.node("gitaly-3").reads.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_malformed_notification_disables_cache() {
    let h = Harness::new(NODES);
    h.create("a.git").await.unwrap();
    h.settle().await;
    h.read("a.git").await.unwrap();
    assert_eq!(h.cache.len(VIRTUAL_STORAGE), 1);

    h.cache.handle_event(FeedEvent::Notification(Notification {
        channel: repoward::datastore::notification::REPOSITORIES_UPDATES_CHANNEL.to_string(),
        payload: "not json".to_string(),
    }));
    assert!(!h.cache.is_enabled());
    assert_eq!(h.cache.len(VIRTUAL_STORAGE), 0);

    // reads keep working straight off the datastore
    for _ in 0..3 {
        let body = h.read("a.git").await.unwrap();
        assert!(body.ends_with(b":init"));
    }
    assert_eq!(cache_count(&h, "populate"), 1);
    assert_eq!(h.cache.len(VIRTUAL_STORAGE), 0);

    h.cache.handle_event(FeedEvent::Connected);
    assert!(h.cache.is_enabled());
    h.read("a.git").await.unwrap();
    assert_eq!(cache_count(&h, "populate"), 2);
}

#[tokio::test]
async fn test_disconnected_feed_disables_cache() {
    let h = Harness::new(NODES);
    h.create("a.git").await.unwrap();
    h.settle().await;
    h.read("a.git").await.unwrap();

    h.cache
        .handle_event(FeedEvent::Disconnected("listener lost".to_string()));
    assert!(!h.cache.is_enabled());
    assert_eq!(h.cache.len(VIRTUAL_STORAGE), 0);
    h.read("a.git").await.unwrap();
    assert_eq!(h.cache.len(VIRTUAL_STORAGE), 0);
}
