//! In-process metrics for the ingestion pipeline.
//!
//! Counters, gauges and histograms are keyed by name plus a sorted label
//! set. Hot paths take a read lock and touch an atomic; the write lock is
//! only taken the first time a key is seen.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

pub const SESSIONS_OPENED: &str = "ingest.sessions.opened";
pub const SESSIONS_ACTIVE: &str = "ingest.sessions.active";
pub const SESSIONS_ENDED: &str = "ingest.sessions.ended";
pub const ENVELOPES_RECEIVED: &str = "ingest.envelopes.received";
pub const ENVELOPES_PERSISTED: &str = "ingest.envelopes.persisted";
pub const ENVELOPES_FAILED: &str = "ingest.envelopes.failed";
pub const ENVELOPES_RETRIED: &str = "ingest.envelopes.retried";
pub const ENVELOPES_DEAD_LETTERED: &str = "ingest.envelopes.dead_lettered";
pub const DECODE_FAILURES: &str = "ingest.decode.failures";
pub const QUEUE_DEPTH: &str = "ingest.queue.depth";
pub const PERSIST_DURATION_MS: &str = "ingest.persist.duration_ms";

/// Bounded reservoir; older observations are overwritten.
const HISTOGRAM_CAPACITY: usize = 4096;

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    /// `name{k=v,...}`, or just `name` without labels.
    fn render(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}{{{}}}", self.name, labels.join(","))
    }
}

#[derive(Default)]
struct Histogram {
    observations: Mutex<Vec<f64>>,
    count: AtomicU64,
}

impl Histogram {
    fn observe(&self, value: f64) {
        let n = self.count.fetch_add(1, Ordering::Relaxed) as usize;
        let mut obs = self.observations.lock();
        if obs.len() < HISTOGRAM_CAPACITY {
            obs.push(value);
        } else {
            obs[n % HISTOGRAM_CAPACITY] = value;
        }
    }

    fn summary(&self) -> HistogramSummary {
        let mut obs = self.observations.lock().clone();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(|a, b| a.total_cmp(b));
        let len = obs.len();
        let pct = |p: f64| obs[((len as f64 * p) as usize).min(len - 1)];
        HistogramSummary {
            count: self.count.load(Ordering::Relaxed),
            p50: pct(0.50),
            p95: pct(0.95),
            p99: pct(0.99),
            max: obs[len - 1],
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Point-in-time copy of every metric, rendered with its labels.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
}

/// Thread-safe metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    gauges: RwLock<HashMap<MetricKey, AtomicI64>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_default()
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Move a gauge by delta (negative to decrease).
    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Record a histogram observation.
    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        self.histograms.write().entry(key).or_default().observe(value);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges
            .read()
            .get(&key)
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .read()
                .iter()
                .map(|(k, c)| (k.render(), c.load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(k, g)| (k.render(), g.load(Ordering::Relaxed)))
                .collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .map(|(k, h)| (k.render(), h.summary()))
                .collect(),
        }
    }
}
