//! Bespoke in-process metrics sink: a bounded-window ring buffer per named
//! counter/histogram, queried by the health/metrics endpoints for a quick
//! operational snapshot. Distinct from the ambient Prometheus exporter in
//! `platform`, which external scrapers pull from directly — this sink is
//! for values the orchestrator itself wants to reason about (e.g. recent
//! auto-approval rate) without round-tripping through a scrape.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

struct BoundedWindow {
    capacity: usize,
    points: VecDeque<f64>,
}

impl BoundedWindow {
    fn new(capacity: usize) -> Self {
        Self { capacity, points: VecDeque::with_capacity(capacity.min(1024)) }
    }

    fn push(&mut self, value: f64) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(value);
    }

    fn mean(&self) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        self.points.iter().sum::<f64>() / self.points.len() as f64
    }

    fn count(&self) -> usize {
        self.points.len()
    }

    /// Nearest-rank percentile over the current window. `p` is in `[0, 100]`.
    fn percentile(&self, p: f64) -> f64 {
        if self.points.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.points.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = ((p / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }
}

/// p50/p90/p99 snapshot for a single named histogram window.
#[derive(Debug, Clone, Copy, Default)]
pub struct PercentileSummary {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
}

pub struct MetricsSink {
    window_capacity: usize,
    histogram_capacity: usize,
    counters: Arc<DashMap<String, u64>>,
    windows: Arc<DashMap<String, Mutex<BoundedWindow>>>,
}

impl MetricsSink {
    pub fn new(window_capacity: usize, histogram_capacity: usize) -> Self {
        Self {
            window_capacity,
            histogram_capacity,
            counters: Arc::new(DashMap::new()),
            windows: Arc::new(DashMap::new()),
        }
    }

    pub fn increment_counter(&self, name: &str) {
        *self.counters.entry(name.to_string()).or_insert(0) += 1;
        metrics::counter!(name.to_string()).increment(1);
    }

    pub async fn observe(&self, name: &str, value: f64) {
        let entry = self
            .windows
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(BoundedWindow::new(self.window_capacity)));
        entry.lock().await.push(value);
        metrics::histogram!(name.to_string()).record(value);
    }

    pub async fn observe_latency_ms(&self, name: &str, value: f64) {
        let entry = self
            .windows
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(BoundedWindow::new(self.histogram_capacity)));
        entry.lock().await.push(value);
        metrics::histogram!(name.to_string()).record(value);
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    pub async fn window_mean(&self, name: &str) -> f64 {
        match self.windows.get(name) {
            Some(window) => window.lock().await.mean(),
            None => 0.0,
        }
    }

    pub async fn window_count(&self, name: &str) -> usize {
        match self.windows.get(name) {
            Some(window) => window.lock().await.count(),
            None => 0,
        }
    }

    /// p50/p90/p99 for a named window, used by the dashboard/summary views.
    pub async fn percentiles(&self, name: &str) -> PercentileSummary {
        match self.windows.get(name) {
            Some(window) => {
                let window = window.lock().await;
                PercentileSummary {
                    p50: window.percentile(50.0),
                    p90: window.percentile(90.0),
                    p99: window.percentile(99.0),
                }
            }
            None => PercentileSummary::default(),
        }
    }
}

impl Default for MetricsSink {
    fn default() -> Self {
        Self::new(10_000, 1_000)
    }
}
