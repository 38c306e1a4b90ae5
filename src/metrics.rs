//! Engine counters and gauges

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Shared metrics collector; clones point at the same counters
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<MetricsInner>>,
}

struct MetricsInner {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, f64>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsInner {
                counters: BTreeMap::new(),
                gauges: BTreeMap::new(),
                start_time: Instant::now(),
            })),
        }
    }

    pub async fn increment(&self, name: &str, value: u64) {
        let mut inner = self.inner.write().await;
        *inner.counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub async fn gauge(&self, name: &str, value: f64) {
        let mut inner = self.inner.write().await;
        inner.gauges.insert(name.to_string(), value);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().await;
        MetricsSnapshot {
            counters: inner.counters.clone(),
            gauges: inner.gauges.clone(),
            uptime_secs: inner.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Metric names
pub mod names {
    pub const ROUNDS_COMPLETED: &str = "rounds_completed_total";
    pub const ROUNDS_FAILED: &str = "rounds_failed_total";
    pub const BRAINS_SKIPPED: &str = "brains_skipped_total";
    pub const CANDIDATES_GENERATED: &str = "candidates_generated_total";
    pub const CANDIDATES_SELECTED: &str = "candidates_selected_total";
    pub const MEMORIES_ARCHIVED: &str = "memories_archived_total";
    pub const STATE_RESETS: &str = "state_resets_total";

    pub const LAST_CONTEST: &str = "last_contest";
    pub const BEST_HITS: &str = "best_hits_last_round";
}
