//! Engine metrics
//!
//! Lock-free counters for the tick path plus a sampled latency tracker for
//! batch processing time. Exported as a sorted map for scraping.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Core counters for the aggregation engine.
pub struct EngineMetrics {
    // Ingestion
    pub ticks_processed: AtomicU64,
    pub ticks_rejected: AtomicU64,
    pub batch_processing_ns: Mutex<LatencyTracker>,

    // Aggregation
    pub bars_finalized: AtomicU64,
    pub snapshots_published: AtomicU64,

    // Publication
    pub cache_failures: AtomicU64,

    // Feed and subscriptions
    pub reconnects: AtomicU64,
    pub rotations: AtomicU64,
    pub subscribed: AtomicU64,

    // Backfill
    pub backfill_bars: AtomicU64,
    pub backfill_failures: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            ticks_processed: AtomicU64::new(0),
            ticks_rejected: AtomicU64::new(0),
            batch_processing_ns: Mutex::new(LatencyTracker::new(1000)),
            bars_finalized: AtomicU64::new(0),
            snapshots_published: AtomicU64::new(0),
            cache_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            subscribed: AtomicU64::new(0),
            backfill_bars: AtomicU64::new(0),
            backfill_failures: AtomicU64::new(0),
        }
    }

    /// Record a processed tick batch.
    pub fn record_batch(&self, ticks: u64, latency_ns: u64) {
        self.ticks_processed.fetch_add(ticks, Ordering::Relaxed);
        if let Ok(mut tracker) = self.batch_processing_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_rejected_tick(&self) {
        self.ticks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bars_finalized(&self, count: u64) {
        self.bars_finalized.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_failure(&self) {
        self.cache_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotation(&self) {
        self.rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_subscribed(&self, count: u64) {
        self.subscribed.store(count, Ordering::Relaxed);
    }

    pub fn record_backfill(&self, bars: u64) {
        self.backfill_bars.fetch_add(bars, Ordering::Relaxed);
    }

    pub fn record_backfill_failure(&self) {
        self.backfill_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("ticks_processed".to_string(), self.ticks_processed.load(Ordering::Relaxed));
        m.insert("ticks_rejected".to_string(), self.ticks_rejected.load(Ordering::Relaxed));
        m.insert("bars_finalized".to_string(), self.bars_finalized.load(Ordering::Relaxed));
        m.insert("snapshots_published".to_string(), self.snapshots_published.load(Ordering::Relaxed));
        m.insert("cache_failures".to_string(), self.cache_failures.load(Ordering::Relaxed));
        m.insert("reconnects".to_string(), self.reconnects.load(Ordering::Relaxed));
        m.insert("rotations".to_string(), self.rotations.load(Ordering::Relaxed));
        m.insert("subscribed".to_string(), self.subscribed.load(Ordering::Relaxed));
        m.insert("backfill_bars".to_string(), self.backfill_bars.load(Ordering::Relaxed));
        m.insert("backfill_failures".to_string(), self.backfill_failures.load(Ordering::Relaxed));
        if let Ok(tracker) = self.batch_processing_ns.lock() {
            for (name, p) in [("batch_p50_ns", 50), ("batch_p99_ns", 99)] {
                if let Some(v) = tracker.percentile(p) {
                    m.insert(name.to_string(), v);
                }
            }
        }
        m
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: Vec<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: Vec::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_export() {
        let metrics = EngineMetrics::new();
        metrics.record_batch(3, 1_000);
        metrics.record_batch(2, 2_000);
        metrics.record_bars_finalized(4);
        metrics.record_cache_failure();
        metrics.set_subscribed(200);

        let exported = metrics.export();
        assert_eq!(exported["ticks_processed"], 5);
        assert_eq!(exported["bars_finalized"], 4);
        assert_eq!(exported["cache_failures"], 1);
        assert_eq!(exported["subscribed"], 200);
        assert_eq!(exported["reconnects"], 0);
        assert_eq!(exported["batch_p50_ns"], 1_000);
        assert_eq!(exported["batch_p99_ns"], 1_000);
    }

    #[test]
    fn test_export_omits_latency_before_first_batch() {
        let exported = EngineMetrics::new().export();
        assert!(!exported.contains_key("batch_p99_ns"));
        assert_eq!(exported["ticks_processed"], 0);
    }

    #[test]
    fn test_latency_tracker_window_eviction() {
        let mut tracker = LatencyTracker::new(3);
        for v in [10, 20, 30, 40] {
            tracker.record(v);
        }
        assert_eq!(tracker.percentile(0), Some(20));
        assert_eq!(tracker.percentile(100), Some(40));
    }
}
