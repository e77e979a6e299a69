//! Entry point of the failover buffer: routes each request to the buffer
//! of the shard it targets.

use crate::config::BufferConfig;
use crate::error::Result;
use crate::metrics::BufferMetrics;
use crate::shard_buffer::{BufferState, RetryDone, ShardBuffer};
use crate::types::ShardKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Buffers requests while a shard's primary is failing over.
///
/// Owns one [`ShardBuffer`] per (keyspace, shard) pair, created lazily on
/// the first request or health event that touches the shard and reused
/// across failovers. All shard buffers share one size budget and one set
/// of metrics.
#[derive(Debug)]
pub struct Buffer {
    config: Arc<BufferConfig>,

    /// Shared budget over buffered requests across all shards.
    size_sema: Arc<Semaphore>,

    metrics: Arc<BufferMetrics>,

    /// Map of (keyspace, shard) to its buffer. Read locks dominate:
    /// entries are inserted once and never removed.
    buffers: RwLock<HashMap<ShardKey, Arc<ShardBuffer>>>,
}

impl Buffer {
    /// Create a buffer with the given configuration.
    pub fn new(config: BufferConfig) -> Self {
        let size_sema = Arc::new(Semaphore::new(config.size));
        Self {
            config: Arc::new(config),
            size_sema,
            metrics: Arc::new(BufferMetrics::new()),
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Hold the request while `keyspace/shard` fails over.
    ///
    /// `observed_err` must be the failover-caused error the request just
    /// saw, or `None` if it saw none; the buffer trusts this
    /// classification. Returns `Ok(None)` when the request should proceed
    /// unbuffered, `Ok(Some(retry_done))` once the request has been
    /// released and should be retried (acknowledge via
    /// [`RetryDone::done`] when the retry finishes), or an error when
    /// buffering failed.
    pub async fn wait_for_failover_end(
        &self,
        ctx: &CancellationToken,
        keyspace: &str,
        shard: &str,
        observed_err: Option<&(dyn std::error::Error + Send + Sync)>,
    ) -> Result<Option<RetryDone>> {
        let buffer = self.get_or_create(keyspace, shard);
        buffer.wait_for_failover_end(ctx, observed_err).await
    }

    /// Record a reparent timestamp observed by the health-check
    /// subsystem. A timestamp newer than anything seen for the shard ends
    /// its failover and starts the drain.
    pub fn record_reparent_timestamp(&self, keyspace: &str, shard: &str, timestamp: i64) {
        self.get_or_create(keyspace, shard)
            .record_reparent_timestamp(timestamp);
    }

    /// Force an end to buffering on a shard whose failover ran longer
    /// than intended. A no-op if the shard is not buffering.
    pub fn stop_for_max_duration(&self, keyspace: &str, shard: &str) {
        if let Some(buffer) = self.shard(keyspace, shard) {
            buffer.stop_for_max_duration();
        }
    }

    /// The buffer serving a shard, if any request or health event ever
    /// touched it.
    pub fn shard(&self, keyspace: &str, shard: &str) -> Option<Arc<ShardBuffer>> {
        let key = ShardKey::new(keyspace, shard);
        self.buffers.read().get(&key).cloned()
    }

    /// Current state of a shard's buffer.
    pub fn shard_state(&self, keyspace: &str, shard: &str) -> Option<BufferState> {
        self.shard(keyspace, shard).map(|b| b.state())
    }

    /// Number of requests currently queued on a shard.
    pub fn queued_requests(&self, keyspace: &str, shard: &str) -> usize {
        self.shard(keyspace, shard)
            .map(|b| b.queued_requests())
            .unwrap_or(0)
    }

    /// Metrics shared by all shard buffers.
    pub fn metrics(&self) -> &Arc<BufferMetrics> {
        &self.metrics
    }

    fn get_or_create(&self, keyspace: &str, shard: &str) -> Arc<ShardBuffer> {
        let key = ShardKey::new(keyspace, shard);
        if let Some(buffer) = self.buffers.read().get(&key) {
            return Arc::clone(buffer);
        }

        let mut buffers = self.buffers.write();
        Arc::clone(buffers.entry(key.clone()).or_insert_with(|| {
            Arc::new(ShardBuffer::new(
                key,
                Arc::clone(&self.config),
                Arc::clone(&self.size_sema),
                Arc::clone(&self.metrics),
            ))
        }))
    }
}
