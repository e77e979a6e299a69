//! Configuration for the failover buffer.

use std::time::Duration;

/// Tunables for the buffer. Read once at construction and treated as
/// constants while the buffer is running.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum number of buffered requests across all shards. This is the
    /// capacity of the shared size budget; when it is exhausted, a shard
    /// with queued requests evicts its own oldest entry and a shard with an
    /// empty queue rejects the request outright.
    pub size: usize,

    /// How long a single request may stay buffered before the timeout
    /// worker evicts it.
    pub window: Duration,

    /// Upper bound on one buffering session. If no reparent is observed
    /// within this duration of the failover start, buffering stops and the
    /// queue is drained anyway.
    pub max_failover_duration: Duration,

    /// Minimum gap between two failovers on the same shard. A failover
    /// error seen within this gap of the previous failover's end passes
    /// through unbuffered, so a flapping shard cannot thrash the buffer.
    pub min_time_between_failovers: Duration,

    /// Number of parallel tasks draining the queue once a failover ends.
    /// 1 drains serially in arrival order, which gives natural backpressure
    /// on the recovering shard.
    pub drain_concurrency: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: 1000,
            window: Duration::from_secs(10),
            max_failover_duration: Duration::from_secs(20),
            min_time_between_failovers: Duration::from_secs(60),
            drain_concurrency: 1,
        }
    }
}

impl BufferConfig {
    /// Create a configuration with the given global size budget.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Set the per-request buffering window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the maximum duration of one buffering session.
    pub fn with_max_failover_duration(mut self, max: Duration) -> Self {
        self.max_failover_duration = max;
        self
    }

    /// Set the minimum gap between failovers on the same shard.
    pub fn with_min_time_between_failovers(mut self, gap: Duration) -> Self {
        self.min_time_between_failovers = gap;
        self
    }

    /// Set the drain parallelism. Values below 1 are treated as 1.
    pub fn with_drain_concurrency(mut self, concurrency: usize) -> Self {
        self.drain_concurrency = concurrency.max(1);
        self
    }
}
