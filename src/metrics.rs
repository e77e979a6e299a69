//! Metrics for monitoring buffering activity.
//!
//! The buffer does not ship its own exporter; these are plain atomic
//! counters and gauges a metrics backend can scrape via [`BufferMetrics`].
//! All series are labeled by (keyspace, shard) so operators can tell which
//! shard is failing over.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter with labels.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    values: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Get the counter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the counter help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Get the label names.
    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    /// Increment the counter with the given labels by 1.
    pub fn inc(&self, labels: [&str; N]) {
        self.inc_by(labels, 1);
    }

    /// Increment the counter with the given labels.
    pub fn inc_by(&self, labels: [&str; N], n: u64) {
        let key: [String; N] = labels.map(|s| s.to_string());

        {
            let values = self.values.read();
            if let Some(counter) = values.get(&key) {
                counter.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }

        let mut values = self.values.write();
        values
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Get the value for specific labels, 0 if the series does not exist.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.values
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get all series with their labels.
    pub fn get_all(&self) -> Vec<([String; N], u64)> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// A gauge that can be set, increased, and decreased, with labels.
#[derive(Debug)]
pub struct LabeledGauge<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    values: RwLock<HashMap<[String; N], AtomicI64>>,
}

impl<const N: usize> LabeledGauge<N> {
    /// Create a new labeled gauge.
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Get the gauge name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get the gauge help text.
    pub fn help(&self) -> &'static str {
        self.help
    }

    /// Get the label names.
    pub fn label_names(&self) -> &[&'static str; N] {
        &self.label_names
    }

    /// Set the gauge with the given labels.
    pub fn set(&self, labels: [&str; N], value: i64) {
        let key: [String; N] = labels.map(|s| s.to_string());
        let mut values = self.values.write();
        values
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    /// Add to the gauge with the given labels.
    pub fn add(&self, labels: [&str; N], n: i64) {
        let key: [String; N] = labels.map(|s| s.to_string());

        {
            let values = self.values.read();
            if let Some(gauge) = values.get(&key) {
                gauge.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }

        let mut values = self.values.write();
        values
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Get the value for specific labels, 0 if the series does not exist.
    pub fn get(&self, labels: [&str; N]) -> i64 {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.values
            .read()
            .get(&key)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get all series with their labels.
    pub fn get_all(&self) -> Vec<([String; N], i64)> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Eviction reason label value: the entry outlived its buffering window.
pub const EVICT_WINDOW: &str = "window";

/// Eviction reason label value: the entry was displaced by a newer request
/// while the global budget was exhausted.
pub const EVICT_PRESSURE: &str = "pressure";

/// All metrics emitted by the buffer.
#[derive(Debug)]
pub struct BufferMetrics {
    /// Requests that entered a shard queue.
    pub requests_buffered: LabeledCounter<2>,

    /// Requests released by a drain at the end of a failover.
    pub requests_drained: LabeledCounter<2>,

    /// Requests evicted before a drain, by reason.
    pub requests_evicted: LabeledCounter<3>,

    /// Requests rejected because the global budget was exhausted and the
    /// shard's own queue was empty.
    pub buffer_full: LabeledCounter<2>,

    /// Total requests buffered during the current (or last) failover.
    /// Reset to 0 when buffering starts.
    pub requests_in_flight_max: LabeledGauge<2>,

    /// Duration of the current (or last) failover in milliseconds.
    /// Reset to 0 when buffering starts.
    pub failover_duration_ms: LabeledGauge<2>,
}

impl BufferMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            requests_buffered: LabeledCounter::new(
                "buffer_requests_buffered_total",
                "Requests that entered a shard buffer queue",
                ["keyspace", "shard"],
            ),
            requests_drained: LabeledCounter::new(
                "buffer_requests_drained_total",
                "Requests released by a drain after failover ended",
                ["keyspace", "shard"],
            ),
            requests_evicted: LabeledCounter::new(
                "buffer_requests_evicted_total",
                "Requests evicted from a shard buffer before the drain",
                ["keyspace", "shard", "reason"],
            ),
            buffer_full: LabeledCounter::new(
                "buffer_full_total",
                "Requests rejected because the buffer was full",
                ["keyspace", "shard"],
            ),
            requests_in_flight_max: LabeledGauge::new(
                "buffer_requests_in_flight_max",
                "Requests buffered during the current or last failover",
                ["keyspace", "shard"],
            ),
            failover_duration_ms: LabeledGauge::new(
                "buffer_failover_duration_ms",
                "Duration of the current or last failover in milliseconds",
                ["keyspace", "shard"],
            ),
        }
    }

    /// Render all series in the Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        write_counter(&mut output, &self.requests_buffered);
        write_counter(&mut output, &self.requests_drained);
        write_counter(&mut output, &self.requests_evicted);
        write_counter(&mut output, &self.buffer_full);
        write_gauge(&mut output, &self.requests_in_flight_max);
        write_gauge(&mut output, &self.failover_duration_ms);
        output
    }

    /// Snapshot of one shard's series, mostly useful in tests.
    pub fn shard_snapshot(&self, keyspace: &str, shard: &str) -> ShardMetricsSnapshot {
        let key = [keyspace, shard];
        ShardMetricsSnapshot {
            requests_buffered: self.requests_buffered.get(key),
            requests_drained: self.requests_drained.get(key),
            requests_evicted_window: self.requests_evicted.get([keyspace, shard, EVICT_WINDOW]),
            requests_evicted_pressure: self.requests_evicted.get([keyspace, shard, EVICT_PRESSURE]),
            buffer_full: self.buffer_full.get(key),
            requests_in_flight_max: self.requests_in_flight_max.get(key),
            failover_duration_ms: self.failover_duration_ms.get(key),
        }
    }
}

impl Default for BufferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn write_counter<const N: usize>(out: &mut String, metric: &LabeledCounter<N>) {
    let _ = writeln!(out, "# HELP {} {}", metric.name(), metric.help());
    let _ = writeln!(out, "# TYPE {} counter", metric.name());
    for (labels, value) in metric.get_all() {
        let series = label_set(metric.label_names(), &labels);
        let _ = writeln!(out, "{}{} {}", metric.name(), series, value);
    }
}

fn write_gauge<const N: usize>(out: &mut String, metric: &LabeledGauge<N>) {
    let _ = writeln!(out, "# HELP {} {}", metric.name(), metric.help());
    let _ = writeln!(out, "# TYPE {} gauge", metric.name());
    for (labels, value) in metric.get_all() {
        let series = label_set(metric.label_names(), &labels);
        let _ = writeln!(out, "{}{} {}", metric.name(), series, value);
    }
}

fn label_set<const N: usize>(names: &[&'static str; N], values: &[String; N]) -> String {
    let mut out = String::from("{");
    for (i, (name, value)) in names.iter().zip(values.iter()).enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}=\"{}\"", name, value);
    }
    out.push('}');
    out
}

/// Point-in-time view of one shard's buffer metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMetricsSnapshot {
    pub requests_buffered: u64,
    pub requests_drained: u64,
    pub requests_evicted_window: u64,
    pub requests_evicted_pressure: u64,
    pub buffer_full: u64,
    pub requests_in_flight_max: i64,
    pub failover_duration_ms: i64,
}
