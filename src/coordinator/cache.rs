//! Cache of up to date storages per repository
//!
//! Entries are only trusted while the change feed is connected. Losing the
//! feed, or receiving a payload that cannot be decoded, disables the cache
//! and drops everything in it; until the next `Connected` event every lookup
//! goes to the authoritative store.
//!
//! Concurrent misses on the same key are collapsed into one store lookup.
//! The other callers wait for it to finish and re-read the cache. A lookup
//! whose key is invalidated while it runs returns its value but does not
//! cache it.

use crate::common::{Error, MetricsRegistry, Result};
use crate::datastore::notification::{decode_payload, FeedEvent, REPOSITORIES_UPDATES_CHANNEL};
use crate::datastore::repositories::{ConsistentStorages, ConsistentStoragesGetter};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

/// Bounded LRU for one virtual storage
struct Lru {
    entries: HashMap<String, (ConsistentStorages, u64)>,
    /// access tick → key, oldest first
    order: BTreeMap<u64, String>,
    tick: u64,
    capacity: usize,
    /// Bumped when the whole cache is dropped; a lookup started under an
    /// older epoch must not populate.
    epoch: u64,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            capacity,
            epoch: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, key: &str) -> Option<ConsistentStorages> {
        let tick = self.next_tick();
        let (value, last) = self.entries.get_mut(key)?;
        self.order.remove(last);
        *last = tick;
        self.order.insert(tick, key.to_string());
        Some(value.clone())
    }

    /// Insert, returning how many entries were evicted
    fn insert(&mut self, key: String, value: ConsistentStorages) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        let tick = self.next_tick();
        if let Some((_, last)) = self.entries.insert(key.clone(), (value, tick)) {
            self.order.remove(&last);
        }
        self.order.insert(tick, key);

        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, tick)) => {
                self.order.remove(&tick);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.epoch += 1;
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

type FlightKey = (String, String);

/// A store lookup under way for one key
struct Lookup {
    done: watch::Sender<()>,
    /// The key was invalidated after the lookup started
    stale: bool,
}

type Flights = Mutex<HashMap<FlightKey, Lookup>>;

/// Removes the in-flight marker and wakes waiters, even if the lookup
/// failed or the leader was cancelled.
struct FlightGuard<'a> {
    flights: &'a Flights,
    key: Option<FlightKey>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut flights = match self.flights.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // dropping the sender wakes every subscriber
            flights.remove(&key);
        }
    }
}

enum Flight {
    Leader,
    Follower(watch::Receiver<()>),
}

/// `ConsistentStoragesGetter` with caching, invalidation and single-flight
pub struct ConsistentStoragesCache {
    store: Arc<dyn ConsistentStoragesGetter>,
    caches: HashMap<String, Mutex<Lru>>,
    allowed: bool,
    enabled: AtomicBool,
    /// Locked after a `caches` entry when both are held
    flights: Flights,
    metrics: Arc<MetricsRegistry>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ConsistentStoragesCache {
    /// Cache for `virtual_storages`. Starts disabled until the feed
    /// reports `Connected`. With `allowed == false` it never enables.
    pub fn new(
        store: Arc<dyn ConsistentStoragesGetter>,
        virtual_storages: &[String],
        max_entries: usize,
        allowed: bool,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            caches: virtual_storages
                .iter()
                .map(|vs| (vs.clone(), Mutex::new(Lru::new(max_entries))))
                .collect(),
            allowed,
            enabled: AtomicBool::new(false),
            flights: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Feed is live, start caching
    pub fn connected(&self) {
        if self.allowed && !self.enabled.swap(true, Ordering::AcqRel) {
            tracing::info!("consistent storages cache enabled");
        }
    }

    /// Feed is gone or untrustworthy: stop caching and drop everything
    pub fn disconnect(&self) {
        self.enabled.store(false, Ordering::Release);
        for cache in self.caches.values() {
            lock(cache).clear();
        }
    }

    /// Drop the cached entry for one repository
    pub fn invalidate(&self, virtual_storage: &str, relative_path: &str) {
        if let Some(cache) = self.caches.get(virtual_storage) {
            let removed = {
                let mut cache = lock(cache);
                let key = (virtual_storage.to_string(), relative_path.to_string());
                if let Some(lookup) = lock(&self.flights).get_mut(&key) {
                    lookup.stale = true;
                }
                cache.remove(relative_path)
            };
            if removed {
                self.metrics
                    .cache_access
                    .inc(&[virtual_storage, "invalidate"]);
            }
        }
    }

    pub fn len(&self, virtual_storage: &str) -> usize {
        self.caches
            .get(virtual_storage)
            .map(|c| lock(c).len())
            .unwrap_or(0)
    }

    /// Apply one change feed event
    pub fn handle_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Connected => self.connected(),
            FeedEvent::Disconnected(reason) => {
                tracing::warn!(reason = %reason, "change feed disconnected, disabling cache");
                self.disconnect();
            }
            FeedEvent::Notification(notification) => {
                if notification.channel != REPOSITORIES_UPDATES_CHANNEL {
                    tracing::debug!(channel = %notification.channel, "ignoring notification");
                    return;
                }
                match decode_payload(&notification.payload) {
                    Ok(entries) => {
                        for entry in entries {
                            if !self.caches.contains_key(&entry.virtual_storage) {
                                tracing::warn!(
                                    virtual_storage = %entry.virtual_storage,
                                    "notification for unknown virtual storage"
                                );
                                continue;
                            }
                            for relative_path in &entry.relative_paths {
                                self.invalidate(&entry.virtual_storage, relative_path);
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            "malformed change notification, disabling cache"
                        );
                        self.disconnect();
                    }
                }
            }
        }
    }

    /// Invalidation loop: consumes the feed until it closes
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<FeedEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        tracing::warn!("change feed closed, disabling cache");
        self.disconnect();
    }

    fn cached(&self, cache: &Mutex<Lru>, virtual_storage: &str, relative_path: &str) -> Option<ConsistentStorages> {
        let value = lock(cache).get(relative_path);
        if value.is_some() {
            self.metrics.cache_access.inc(&[virtual_storage, "hit"]);
        }
        value
    }

    fn join_flight(&self, key: &FlightKey) -> Flight {
        let mut flights = lock(&self.flights);
        match flights.get(key) {
            Some(lookup) => Flight::Follower(lookup.done.subscribe()),
            None => {
                let (done, _) = watch::channel(());
                flights.insert(key.clone(), Lookup { done, stale: false });
                Flight::Leader
            }
        }
    }
}

#[tonic::async_trait]
impl ConsistentStoragesGetter for ConsistentStoragesCache {
    async fn get_consistent_storages(
        &self,
        virtual_storage: &str,
        relative_path: &str,
    ) -> Result<ConsistentStorages> {
        let cache = self
            .caches
            .get(virtual_storage)
            .ok_or_else(|| Error::UnknownVirtualStorage(virtual_storage.to_string()))?;

        if !self.is_enabled() {
            return self
                .store
                .get_consistent_storages(virtual_storage, relative_path)
                .await;
        }

        let key = (virtual_storage.to_string(), relative_path.to_string());
        loop {
            if let Some(value) = self.cached(cache, virtual_storage, relative_path) {
                return Ok(value);
            }

            match self.join_flight(&key) {
                Flight::Follower(mut done) => {
                    // Err means the leader finished
                    let _ = done.changed().await;
                    if !self.is_enabled() {
                        return self
                            .store
                            .get_consistent_storages(virtual_storage, relative_path)
                            .await;
                    }
                }
                Flight::Leader => {
                    let _guard = FlightGuard {
                        flights: &self.flights,
                        key: Some(key.clone()),
                    };
                    // the leader may have raced with a populate
                    if let Some(value) = self.cached(cache, virtual_storage, relative_path) {
                        return Ok(value);
                    }

                    self.metrics.cache_access.inc(&[virtual_storage, "miss"]);
                    let epoch = lock(cache).epoch;
                    let value = self
                        .store
                        .get_consistent_storages(virtual_storage, relative_path)
                        .await?;

                    if self.is_enabled() {
                        let mut cache = lock(cache);
                        let stale = cache.epoch != epoch
                            || lock(&self.flights).get(&key).map_or(true, |l| l.stale);
                        if !stale {
                            let evicted = cache.insert(relative_path.to_string(), value.clone());
                            drop(cache);
                            self.metrics
                                .cache_access
                                .inc(&[virtual_storage, "populate"]);
                            if evicted > 0 {
                                self.metrics.cache_access.add(
                                    &[virtual_storage, "evict"],
                                    evicted as u64,
                                );
                            }
                        }
                    }
                    return Ok(value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::notification::ChangeFeed;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingStore {
        calls: AtomicUsize,
        delay: Duration,
        fail: AtomicBool,
    }

    impl CountingStore {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                fail: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[tonic::async_trait]
    impl ConsistentStoragesGetter for CountingStore {
        async fn get_consistent_storages(
            &self,
            _virtual_storage: &str,
            relative_path: &str,
        ) -> Result<ConsistentStorages> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Internal("store unavailable".into()));
            }
            Ok(ConsistentStorages {
                replica_path: format!("@cluster/{}/{}", relative_path, call),
                storages: BTreeSet::from(["gitaly-1".to_string()]),
            })
        }
    }

    fn cache(store: Arc<CountingStore>, max_entries: usize) -> Arc<ConsistentStoragesCache> {
        let cache = Arc::new(ConsistentStoragesCache::new(
            store,
            &["default".to_string()],
            max_entries,
            true,
            Arc::new(MetricsRegistry::new()),
        ));
        cache.connected();
        cache
    }

    #[tokio::test]
    async fn test_repeated_lookups_hit_the_cache() {
        let store = CountingStore::new(Duration::ZERO);
        let cache = cache(store.clone(), 16);

        let first = cache.get_consistent_storages("default", "repo.git").await.unwrap();
        let second = cache.get_consistent_storages("default", "repo.git").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_lookup() {
        let store = CountingStore::new(Duration::from_millis(50));
        let cache = cache(store.clone(), 16);

        let (a, b) = tokio::join!(
            cache.get_consistent_storages("default", "repo.git"),
            cache.get_consistent_storages("default", "repo.git"),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_invalidation_keeps_single_lookup() {
        let store = CountingStore::new(Duration::from_millis(50));
        let cache = cache(store.clone(), 16);

        let invalidate = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.invalidate("default", "other.git");
        };
        let (a, b, _) = tokio::join!(
            cache.get_consistent_storages("default", "repo.git"),
            cache.get_consistent_storages("default", "repo.git"),
            invalidate,
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(store.calls(), 1);
        assert_eq!(cache.len("default"), 1);
    }

    #[tokio::test]
    async fn test_invalidation_during_lookup_skips_populate() {
        let store = CountingStore::new(Duration::from_millis(50));
        let cache = cache(store.clone(), 16);

        let invalidate = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.invalidate("default", "repo.git");
        };
        let (first, _) = tokio::join!(
            cache.get_consistent_storages("default", "repo.git"),
            invalidate,
        );
        first.unwrap();
        assert_eq!(cache.len("default"), 0);

        cache.get_consistent_storages("default", "repo.git").await.unwrap();
        assert_eq!(store.calls(), 2);
        assert_eq!(cache.len("default"), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_releases_waiters() {
        let store = CountingStore::new(Duration::from_millis(20));
        store.fail.store(true, Ordering::SeqCst);
        let cache = cache(store.clone(), 16);

        let (a, b) = tokio::join!(
            cache.get_consistent_storages("default", "repo.git"),
            cache.get_consistent_storages("default", "repo.git"),
        );
        assert!(a.is_err());
        assert!(b.is_err());

        store.fail.store(false, Ordering::SeqCst);
        assert!(cache.get_consistent_storages("default", "repo.git").await.is_ok());
    }

    #[tokio::test]
    async fn test_notification_invalidates_entry() {
        let store = CountingStore::new(Duration::ZERO);
        let cache = cache(store.clone(), 16);
        let (feed, mut rx) = ChangeFeed::channel();

        let before = cache.get_consistent_storages("default", "repo.git").await.unwrap();
        feed.publish([("default", "repo.git")]);
        cache.handle_event(rx.recv().await.unwrap());

        let after = cache.get_consistent_storages("default", "repo.git").await.unwrap();
        assert_ne!(before, after);
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_payload_disables_until_reconnect() {
        let store = CountingStore::new(Duration::ZERO);
        let cache = cache(store.clone(), 16);
        let (feed, mut rx) = ChangeFeed::channel();

        cache.get_consistent_storages("default", "repo.git").await.unwrap();
        feed.publish_raw("{broken");
        cache.handle_event(rx.recv().await.unwrap());
        assert!(!cache.is_enabled());
        assert_eq!(cache.len("default"), 0);

        cache.get_consistent_storages("default", "repo.git").await.unwrap();
        cache.get_consistent_storages("default", "repo.git").await.unwrap();
        assert_eq!(store.calls(), 3);

        feed.connected();
        cache.handle_event(rx.recv().await.unwrap());
        cache.get_consistent_storages("default", "repo.git").await.unwrap();
        cache.get_consistent_storages("default", "repo.git").await.unwrap();
        assert_eq!(store.calls(), 4);
    }

    #[tokio::test]
    async fn test_unknown_virtual_storage_in_notification_is_skipped() {
        let store = CountingStore::new(Duration::ZERO);
        let cache = cache(store.clone(), 16);
        let (feed, mut rx) = ChangeFeed::channel();

        cache.get_consistent_storages("default", "repo.git").await.unwrap();
        feed.publish([("other", "repo.git")]);
        cache.handle_event(rx.recv().await.unwrap());

        assert!(cache.is_enabled());
        cache.get_consistent_storages("default", "repo.git").await.unwrap();
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_used() {
        let store = CountingStore::new(Duration::ZERO);
        let cache = cache(store.clone(), 2);

        cache.get_consistent_storages("default", "a").await.unwrap();
        cache.get_consistent_storages("default", "b").await.unwrap();
        cache.get_consistent_storages("default", "a").await.unwrap();
        cache.get_consistent_storages("default", "c").await.unwrap();
        assert_eq!(cache.len("default"), 2);
        assert_eq!(store.calls(), 3);

        // "b" was evicted, "a" survived
        cache.get_consistent_storages("default", "a").await.unwrap();
        assert_eq!(store.calls(), 3);
        cache.get_consistent_storages("default", "b").await.unwrap();
        assert_eq!(store.calls(), 4);
    }

    #[tokio::test]
    async fn test_never_enabled_when_disallowed() {
        let store = CountingStore::new(Duration::ZERO);
        let cache = ConsistentStoragesCache::new(
            store.clone(),
            &["default".to_string()],
            16,
            false,
            Arc::new(MetricsRegistry::new()),
        );
        cache.connected();
        cache.get_consistent_storages("default", "repo.git").await.unwrap();
        cache.get_consistent_storages("default", "repo.git").await.unwrap();
        assert_eq!(store.calls(), 2);
    }
}
