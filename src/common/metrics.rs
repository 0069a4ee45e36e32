//! In-process metrics
//!
//! Prometheus-compatible counters and latency histograms for:
//! - cache access (hit, miss, populate, evict) per virtual storage
//! - routed RPCs per method and outcome
//! - transaction outcomes
//! - replication job outcomes
//! - node health transitions

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(LATENCY_BUCKETS.len() + 1);
        for _ in 0..=LATENCY_BUCKETS.len() {
            buckets.push(AtomicU64::new(0));
        }
        Self {
            buckets,
            boundaries: LATENCY_BUCKETS.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // stored as microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative buckets, last one is +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter family keyed by label values
#[derive(Debug)]
pub struct CounterVec {
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
    values: Mutex<BTreeMap<Vec<String>, u64>>,
}

impl CounterVec {
    pub const fn new(
        name: &'static str,
        help: &'static str,
        labels: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            labels,
            values: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn inc(&self, label_values: &[&str]) {
        self.add(label_values, 1);
    }

    pub fn add(&self, label_values: &[&str], n: u64) {
        debug_assert_eq!(label_values.len(), self.labels.len());
        let key = label_values.iter().map(|v| v.to_string()).collect();
        if let Ok(mut values) = self.values.lock() {
            *values.entry(key).or_insert(0) += n;
        }
    }

    pub fn get(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(&key).copied())
            .unwrap_or(0)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let Ok(values) = self.values.lock() else {
            return;
        };
        for (label_values, value) in values.iter() {
            let labels: Vec<String> = self
                .labels
                .iter()
                .zip(label_values)
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect();
            let _ = writeln!(out, "{}{{{}}} {}", self.name, labels.join(","), value);
        }
    }
}

/// Metrics registry shared by the proxy components
#[derive(Debug)]
pub struct MetricsRegistry {
    pub cache_access: CounterVec,
    pub rpc_requests: CounterVec,
    pub transactions: CounterVec,
    pub replication_jobs: CounterVec,
    pub health_transitions: CounterVec,
    rpc_latency: Mutex<BTreeMap<String, std::sync::Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            cache_access: CounterVec::new(
                "repoward_uptodate_storages_cache_access_total",
                "Cache operations while resolving up to date storages",
                &["virtual_storage", "type"],
            ),
            rpc_requests: CounterVec::new(
                "repoward_rpc_requests_total",
                "Routed RPCs by method and outcome",
                &["method", "outcome"],
            ),
            transactions: CounterVec::new(
                "repoward_transactions_total",
                "Decided transactions by outcome",
                &["outcome"],
            ),
            replication_jobs: CounterVec::new(
                "repoward_replication_jobs_total",
                "Replication job acknowledgements by virtual storage and state",
                &["virtual_storage", "state"],
            ),
            health_transitions: CounterVec::new(
                "repoward_node_health_transitions_total",
                "Node health transitions",
                &["virtual_storage", "storage", "to"],
            ),
            rpc_latency: Mutex::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    pub fn observe_rpc(&self, method: &str, duration: Duration, success: bool) {
        self.rpc_requests
            .inc(&[method, if success { "ok" } else { "error" }]);
        let histogram = match self.rpc_latency.lock() {
            Ok(mut latency) => latency.entry(method.to_string()).or_default().clone(),
            Err(_) => return,
        };
        histogram.observe(duration.as_secs_f64() * 1000.0);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP repoward_uptime_seconds Server uptime in seconds\n");
        out.push_str("# TYPE repoward_uptime_seconds gauge\n");
        let _ = writeln!(out, "repoward_uptime_seconds {}", self.uptime_seconds());

        self.cache_access.render(&mut out);
        self.rpc_requests.render(&mut out);
        self.transactions.render(&mut out);
        self.replication_jobs.render(&mut out);
        self.health_transitions.render(&mut out);

        out.push_str("# HELP repoward_rpc_duration_ms RPC duration in milliseconds\n");
        out.push_str("# TYPE repoward_rpc_duration_ms histogram\n");
        if let Ok(latency) = self.rpc_latency.lock() {
            for (method, histogram) in latency.iter() {
                for (le, count) in histogram.get_buckets() {
                    let le = if le.is_infinite() {
                        "+Inf".to_string()
                    } else {
                        le.to_string()
                    };
                    let _ = writeln!(
                        out,
                        "repoward_rpc_duration_ms_bucket{{method=\"{}\",le=\"{}\"}} {}",
                        method, le, count
                    );
                }
                let _ = writeln!(
                    out,
                    "repoward_rpc_duration_ms_sum{{method=\"{}\"}} {}",
                    method,
                    histogram.sum()
                );
                let _ = writeln!(
                    out,
                    "repoward_rpc_duration_ms_count{{method=\"{}\"}} {}",
                    method,
                    histogram.count()
                );
            }
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
