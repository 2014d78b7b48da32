//! In-memory operation metrics.
//!
//! Two bounded ring buffers (writes and reads) behind a read/write lock.
//! Appends hold the lock just long enough to push; summary and recent-stream
//! builders copy the buffers out and compute after releasing it.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use crate::strategies::{OperationMetrics, StrategyKind};

/// Metrics kept per buffer before the oldest entries are dropped.
const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Default)]
struct Buffers {
    writes: VecDeque<OperationMetrics>,
    reads: VecDeque<OperationMetrics>,
}

pub struct MetricsStore {
    inner: RwLock<Buffers>,
    capacity: usize,
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Buffers::default()),
            capacity,
        }
    }

    pub fn record_write(&self, metrics: OperationMetrics) {
        let mut inner = self.inner.write().expect("metrics lock poisoned");
        push_bounded(&mut inner.writes, metrics, self.capacity);
    }

    pub fn record_read(&self, metrics: OperationMetrics) {
        let mut inner = self.inner.write().expect("metrics lock poisoned");
        push_bounded(&mut inner.reads, metrics, self.capacity);
    }

    pub fn write_count(&self) -> usize {
        self.inner.read().expect("metrics lock poisoned").writes.len()
    }

    pub fn read_count(&self) -> usize {
        self.inner.read().expect("metrics lock poisoned").reads.len()
    }

    /// Aggregate per-strategy latency, fan-out and cache-hit figures. Copies
    /// the buffers under the read lock, computes after releasing it.
    pub fn summary(&self) -> MetricsSummary {
        let (writes, reads) = {
            let inner = self.inner.read().expect("metrics lock poisoned");
            (
                inner.writes.iter().cloned().collect::<Vec<_>>(),
                inner.reads.iter().cloned().collect::<Vec<_>>(),
            )
        };

        let mut summary = MetricsSummary {
            total_writes: writes.len(),
            total_reads: reads.len(),
            by_strategy: BTreeMap::new(),
        };

        for kind in StrategyKind::ALL {
            let name = kind.as_str();
            let strategy_writes: Vec<&OperationMetrics> =
                writes.iter().filter(|m| m.strategy == name).collect();
            let strategy_reads: Vec<&OperationMetrics> =
                reads.iter().filter(|m| m.strategy == name).collect();

            let mut entry = StrategySummary {
                write_count: strategy_writes.len(),
                read_count: strategy_reads.len(),
                ..StrategySummary::default()
            };

            if !strategy_writes.is_empty() {
                let mut durations: Vec<Duration> =
                    strategy_writes.iter().map(|m| m.duration).collect();
                durations.sort_unstable();

                entry.write_latency_avg_ms = mean_ms(&durations);
                entry.write_latency_p50_ms = percentile_ms(&durations, 50);
                entry.write_latency_p95_ms = percentile_ms(&durations, 95);
                entry.write_latency_p99_ms = percentile_ms(&durations, 99);

                let total_fan_out: usize =
                    strategy_writes.iter().map(|m| m.fan_out_count).sum();
                entry.avg_fan_out = total_fan_out as f64 / strategy_writes.len() as f64;
            }

            if !strategy_reads.is_empty() {
                let mut durations: Vec<Duration> =
                    strategy_reads.iter().map(|m| m.duration).collect();
                durations.sort_unstable();

                entry.read_latency_avg_ms = mean_ms(&durations);
                entry.read_latency_p50_ms = percentile_ms(&durations, 50);
                entry.read_latency_p95_ms = percentile_ms(&durations, 95);
                entry.read_latency_p99_ms = percentile_ms(&durations, 99);

                let cache_hits = strategy_reads.iter().filter(|m| m.cache_hit).count();
                entry.cache_hit_rate = cache_hits as f64 / strategy_reads.len() as f64;
            }

            summary.by_strategy.insert(name.to_string(), entry);
        }

        summary
    }

    /// The newest `limit` operations across both streams, newest first.
    pub fn recent(&self, limit: usize) -> Vec<OperationMetrics> {
        let mut all = {
            let inner = self.inner.read().expect("metrics lock poisoned");
            let mut all: Vec<OperationMetrics> =
                Vec::with_capacity(inner.writes.len() + inner.reads.len());
            all.extend(inner.writes.iter().cloned());
            all.extend(inner.reads.iter().cloned());
            all
        };

        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        all
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("metrics lock poisoned");
        inner.writes.clear();
        inner.reads.clear();
    }
}

fn push_bounded(buffer: &mut VecDeque<OperationMetrics>, metrics: OperationMetrics, cap: usize) {
    buffer.push_back(metrics);
    while buffer.len() > cap {
        buffer.pop_front();
    }
}

fn mean_ms(sorted: &[Duration]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let total: Duration = sorted.iter().sum();
    total.as_secs_f64() * 1000.0 / sorted.len() as f64
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile_ms(sorted: &[Duration], p: usize) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p * sorted.len() / 100).min(sorted.len() - 1);
    sorted[idx].as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_writes: usize,
    pub total_reads: usize,
    pub by_strategy: BTreeMap<String, StrategySummary>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategySummary {
    pub write_count: usize,
    pub read_count: usize,
    pub write_latency_avg_ms: f64,
    pub write_latency_p50_ms: f64,
    pub write_latency_p95_ms: f64,
    pub write_latency_p99_ms: f64,
    pub read_latency_avg_ms: f64,
    pub read_latency_p50_ms: f64,
    pub read_latency_p95_ms: f64,
    pub read_latency_p99_ms: f64,
    pub avg_fan_out: f64,
    pub cache_hit_rate: f64,
}
