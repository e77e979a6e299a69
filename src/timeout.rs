//! Per-shard timeout worker.

use crate::shard_buffer::ShardBuffer;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Background task enforcing the buffer's two time bounds while a shard is
/// buffering: the head entry's per-request window and the overall failover
/// duration.
///
/// One worker exists per buffering session. A single task with a single
/// sleep covers a queue of any length, because entries expire in arrival
/// order: the head always has the earliest deadline, so waking for a head
/// that has since been replaced simply re-arms the sleep.
#[derive(Debug)]
pub(crate) struct TimeoutWorker {
    queue_not_empty: Arc<Notify>,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl TimeoutWorker {
    /// Spawn the worker. `buffering_deadline` is the instant at which the
    /// whole failover has run for too long and buffering must stop.
    pub(crate) fn spawn(buffer: Arc<ShardBuffer>, buffering_deadline: Instant) -> Self {
        let queue_not_empty = Arc::new(Notify::new());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run(
            buffer,
            Arc::clone(&queue_not_empty),
            stop.clone(),
            buffering_deadline,
        ));
        Self {
            queue_not_empty,
            stop,
            handle,
        }
    }

    /// Wake the worker after the queue transitioned from empty to
    /// non-empty.
    pub(crate) fn notify_queue_not_empty(&self) {
        self.queue_not_empty.notify_one();
    }

    /// Stop the worker and wait for it to exit. Must be called outside the
    /// shard buffer lock; the worker may be blocked on that lock.
    pub(crate) async fn stop(self) {
        self.stop.cancel();
        let _ = self.handle.await;
    }
}

async fn run(
    buffer: Arc<ShardBuffer>,
    queue_not_empty: Arc<Notify>,
    stop: CancellationToken,
    buffering_deadline: Instant,
) {
    loop {
        let head = buffer.oldest_entry();
        let wake_at = match &head {
            Some(entry) => entry.deadline().min(buffering_deadline),
            None => buffering_deadline,
        };

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = queue_not_empty.notified() => continue,
            _ = tokio::time::sleep_until(wake_at) => {}
        }

        if Instant::now() >= buffering_deadline {
            debug!(
                shard = %buffer.key(),
                "failover did not finish in time, stopping the buffer"
            );
            buffer.stop_for_max_duration();
            return;
        }

        if let Some(entry) = head {
            if Instant::now() >= entry.deadline() {
                // Re-checked under the shard lock; a no-op if the entry is
                // no longer the head.
                buffer.evict_oldest(&entry).await;
            }
        }
    }
}
