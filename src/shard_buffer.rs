//! Per-shard buffering state machine.
//!
//! A [`ShardBuffer`] holds requests for a single (keyspace, shard) pair
//! while the shard's primary is failing over, and releases them once a new
//! primary is observed. The object is reused across failovers; whenever no
//! failover is in progress it sits in the `Idle` state.
//!
//! The buffer is accessed concurrently by:
//! - request tasks calling [`ShardBuffer::wait_for_failover_end`]
//! - the health-check listener calling [`ShardBuffer::record_reparent_timestamp`]
//! - the timeout worker evicting entries that outlived their window
//! - the drain task releasing the queue after the failover ends

use crate::config::BufferConfig;
use crate::error::{Error, Result};
use crate::metrics::{BufferMetrics, EVICT_PRESSURE, EVICT_WINDOW};
use crate::timeout::TimeoutWorker;
use crate::types::ShardKey;
use parking_lot::{Mutex, RwLock};
use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info};

/// Lifecycle of a shard buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// No failover is currently in progress.
    Idle,

    /// A failover is in progress and requests are being queued.
    Buffering,

    /// The failover ended and the queue is being released.
    Draining,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferState::Idle => write!(f, "IDLE"),
            BufferState::Buffering => write!(f, "BUFFERING"),
            BufferState::Draining => write!(f, "DRAINING"),
        }
    }
}

/// One buffered request.
///
/// An entry is owned by the shard queue while queued. Whichever actor
/// removes it from the queue takes the completion sender (so the signal
/// fires exactly once) and becomes responsible for its budget slot.
#[derive(Debug)]
pub(crate) struct Entry {
    /// When the entry falls out of its buffering window and must be
    /// evicted.
    deadline: Instant,

    /// Completion signal. A `None` payload tells the waiter the failover
    /// is over and the request should be retried now.
    done: Mutex<Option<oneshot::Sender<Option<Error>>>>,

    /// Cancelled by the waiter (through [`RetryDone`]) once its retry has
    /// finished. The buffer holds the budget slot until then.
    release_token: CancellationToken,

    /// Slot in the global size budget.
    slot: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Entry {
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Handle returned to a released request.
///
/// The caller retries its original RPC and acknowledges by calling
/// [`RetryDone::done`]. Dropping the handle acknowledges as well, so an
/// abandoned retry cannot stall the drain.
#[must_use = "the buffer waits for this acknowledgement; call done() when the retry finishes"]
#[derive(Debug)]
pub struct RetryDone {
    _guard: DropGuard,
}

impl RetryDone {
    /// Signal that the retry has finished.
    pub fn done(self) {}
}

/// Request buffer for a single (keyspace, shard) pair.
#[derive(Debug)]
pub struct ShardBuffer {
    key: ShardKey,
    config: Arc<BufferConfig>,
    size_sema: Arc<Semaphore>,
    metrics: Arc<BufferMetrics>,
    log_too_recent: ThrottledLog,
    inner: RwLock<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: BufferState,

    /// Buffered requests in arrival order. `Some` exactly while
    /// `Buffering`; taken by the drain so late removals see `None` and
    /// no-op.
    queue: Option<VecDeque<Arc<Entry>>>,

    /// Highest reparent timestamp seen for this shard (seconds since
    /// epoch). Never decreases.
    externally_reparented: i64,

    /// When the current (or last) failover started.
    last_start: Option<Instant>,

    /// When the last failover ended.
    last_end: Option<Instant>,

    /// Present exactly while `Buffering`.
    timeout_worker: Option<TimeoutWorker>,
}

impl ShardBuffer {
    pub(crate) fn new(
        key: ShardKey,
        config: Arc<BufferConfig>,
        size_sema: Arc<Semaphore>,
        metrics: Arc<BufferMetrics>,
    ) -> Self {
        Self {
            key,
            config,
            size_sema,
            metrics,
            log_too_recent: ThrottledLog::new(Duration::from_secs(5)),
            inner: RwLock::new(Inner {
                state: BufferState::Idle,
                queue: None,
                externally_reparented: 0,
                last_start: None,
                last_end: None,
                timeout_worker: None,
            }),
        }
    }

    /// The (keyspace, shard) pair this buffer serves.
    pub fn key(&self) -> &ShardKey {
        &self.key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BufferState {
        self.inner.read().state
    }

    /// Number of requests currently queued.
    pub fn queued_requests(&self) -> usize {
        self.inner.read().queue.as_ref().map(|q| q.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn last_reparent_timestamp(&self) -> i64 {
        self.inner.read().externally_reparented
    }

    /// Hold the request while the shard fails over.
    ///
    /// `observed_err` is the failover-caused error the request just saw;
    /// `None` means the request saw no error. Error categories other than
    /// failover-caused unavailability must be filtered out by the caller.
    ///
    /// Returns `Ok(None)` when the request should pass through unbuffered,
    /// `Ok(Some(retry_done))` once the request has been released and should
    /// be retried, or an error when buffering failed.
    pub async fn wait_for_failover_end(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        observed_err: Option<&(dyn std::error::Error + Send + Sync)>,
    ) -> Result<Option<RetryDone>> {
        let failover_detected = observed_err.is_some();

        // Fast path: most requests arrive while the shard is healthy.
        {
            let inner = self.inner.read();
            if !should_buffer(inner.state, failover_detected) {
                return Ok(None);
            }
        }

        let (entry, done) = match self.try_buffer(ctx, observed_err)? {
            Some(buffered) => buffered,
            None => return Ok(None),
        };
        self.wait(ctx, entry, done).await
    }

    /// Re-check under the write lock and enqueue. Returns `Ok(None)` when
    /// the state changed in the meantime and the request should pass
    /// through after all.
    fn try_buffer(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        observed_err: Option<&(dyn std::error::Error + Send + Sync)>,
    ) -> Result<Option<(Arc<Entry>, oneshot::Receiver<Option<Error>>)>> {
        let failover_detected = observed_err.is_some();

        let mut inner = self.inner.write();
        if !should_buffer(inner.state, failover_detected) {
            return Ok(None);
        }

        if inner.state == BufferState::Idle {
            // Do not re-enter buffering right after a failover ended; a
            // flapping shard would otherwise thrash the buffer.
            if let Some(last_end) = inner.last_end {
                let gap = last_end.elapsed();
                if gap < self.config.min_time_between_failovers {
                    drop(inner);
                    if self.log_too_recent.should_log() {
                        info!(
                            shard = %self.key,
                            ?gap,
                            min_gap = ?self.config.min_time_between_failovers,
                            cause = %observed_err.map(|e| e.to_string()).unwrap_or_default(),
                            "not buffering, last failover ended too recently"
                        );
                    }
                    return Ok(None);
                }
            }
            self.start_buffering(&mut inner, observed_err);
        }

        self.buffer_request(&mut inner, ctx).map(Some)
    }

    /// Append a new entry, acquiring a slot in the global size budget.
    /// Called with the write lock held and state `Buffering`.
    fn buffer_request(
        &self,
        inner: &mut Inner,
        ctx: &CancellationToken,
    ) -> Result<(Arc<Entry>, oneshot::Receiver<Option<Error>>)> {
        let queue = match inner.queue {
            Some(ref mut q) => q,
            None => {
                error!(
                    shard = %self.key,
                    backtrace = %Backtrace::force_capture(),
                    "BUG: buffering a request without an active queue"
                );
                return Err(Error::Internal("buffer queue missing".into()));
            }
        };

        let slot = match self.size_sema.clone().try_acquire_owned() {
            Ok(slot) => slot,
            Err(_) => {
                // Budget exhausted. Evict this shard's own oldest entry
                // and reuse its slot. An empty own queue means at least one
                // other shard is failing over and consumes the whole
                // budget; reject this request instead.
                let Some(evicted) = queue.pop_front() else {
                    self.metrics.buffer_full.inc(self.stats_key());
                    return Err(Error::Full);
                };
                if let Some(tx) = evicted.done.lock().take() {
                    let _ = tx.send(Some(Error::Evicted));
                } else {
                    error!(
                        shard = %self.key,
                        backtrace = %Backtrace::force_capture(),
                        "BUG: evicted entry was already unblocked"
                    );
                }
                self.metrics.requests_evicted.inc([
                    self.key.keyspace.as_str(),
                    self.key.shard.as_str(),
                    EVICT_PRESSURE,
                ]);
                let taken = evicted.slot.lock().take();
                match taken {
                    Some(slot) => slot,
                    None => {
                        error!(
                            shard = %self.key,
                            backtrace = %Backtrace::force_capture(),
                            "BUG: evicted entry held no budget slot"
                        );
                        self.size_sema
                            .clone()
                            .try_acquire_owned()
                            .map_err(|_| Error::Full)?
                    }
                }
            }
        };

        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(Entry {
            deadline: Instant::now() + self.config.window,
            done: Mutex::new(Some(tx)),
            release_token: ctx.child_token(),
            slot: Mutex::new(Some(slot)),
        });
        queue.push_back(Arc::clone(&entry));

        self.metrics.requests_buffered.inc(self.stats_key());
        self.metrics.requests_in_flight_max.add(self.stats_key(), 1);

        if queue.len() == 1 {
            if let Some(worker) = &inner.timeout_worker {
                worker.notify_queue_not_empty();
            }
        }

        Ok((entry, rx))
    }

    /// Block until the entry is released or the caller's context fires,
    /// whichever happens first.
    async fn wait(
        &self,
        ctx: &CancellationToken,
        entry: Arc<Entry>,
        done: oneshot::Receiver<Option<Error>>,
    ) -> Result<Option<RetryDone>> {
        // Created up front so every exit path, including a dropped future,
        // acknowledges the release.
        let retry_done = RetryDone {
            _guard: entry.release_token.clone().drop_guard(),
        };

        tokio::select! {
            _ = ctx.cancelled() => {
                self.remove(&entry);
                Err(Error::Canceled)
            }
            released = done => match released {
                Ok(None) => Ok(Some(retry_done)),
                Ok(Some(err)) => Err(err),
                Err(_) => Err(Error::Internal(
                    "buffer dropped the request without releasing it".into(),
                )),
            },
        }
    }

    /// Record a reparent timestamp observed by the health-check
    /// subsystem. Only strictly greater values take effect; a strictly
    /// greater value ends the current failover.
    pub fn record_reparent_timestamp(self: &Arc<Self>, timestamp: i64) {
        // Fast path: equal values repeat while the primary is unchanged,
        // and smaller values can arrive from the old primary after the new
        // one took over. Both are ignored.
        {
            let inner = self.inner.read();
            if timestamp <= inner.externally_reparented {
                return;
            }
        }

        let mut inner = self.inner.write();
        if timestamp <= inner.externally_reparented {
            return;
        }

        inner.externally_reparented = timestamp;
        self.stop_buffering(&mut inner, "failover end detected");
    }

    /// Force an end to buffering because the failover ran longer than the
    /// configured maximum. A no-op unless the buffer is `Buffering`.
    pub fn stop_for_max_duration(self: &Arc<Self>) {
        let mut inner = self.inner.write();
        self.stop_buffering(&mut inner, "max failover duration exceeded");
    }

    /// The head of the queue, if any.
    pub(crate) fn oldest_entry(&self) -> Option<Arc<Entry>> {
        self.inner.read().queue.as_ref().and_then(|q| q.front().cloned())
    }

    /// Evict `candidate` because it outlived its buffering window. A no-op
    /// unless `candidate` is still the head of the queue.
    ///
    /// The entry is released with no error: its waiter's own deadline has
    /// usually expired by the time the window runs out.
    pub(crate) async fn evict_oldest(&self, candidate: &Arc<Entry>) {
        let evicted = {
            let mut inner = self.inner.write();
            let Some(queue) = inner.queue.as_mut() else {
                return;
            };
            match queue.front() {
                Some(head) if Arc::ptr_eq(head, candidate) => {}
                _ => return,
            }
            queue.pop_front()
        };
        let Some(evicted) = evicted else { return };

        self.metrics.requests_evicted.inc([
            self.key.keyspace.as_str(),
            self.key.shard.as_str(),
            EVICT_WINDOW,
        ]);
        self.release_and_wait(&evicted, None).await;
    }

    /// Remove an entry whose waiter departed on its own (caller context
    /// canceled). Idempotent: a no-op if the entry already left the queue
    /// or the queue was handed to the drain.
    pub(crate) fn remove(&self, to_remove: &Arc<Entry>) {
        let mut inner = self.inner.write();
        let Some(queue) = inner.queue.as_mut() else {
            return;
        };
        if let Some(pos) = queue.iter().position(|e| Arc::ptr_eq(e, to_remove)) {
            queue.remove(pos);
            // The waiter itself is departing: close the completion signal
            // and free the budget slot here so nobody else tries to.
            to_remove.done.lock().take();
            drop(to_remove.slot.lock().take());
        }
    }

    /// Transition `Idle` -> `Buffering`. Called with the write lock held.
    fn start_buffering(
        self: &Arc<Self>,
        inner: &mut Inner,
        observed_err: Option<&(dyn std::error::Error + Send + Sync)>,
    ) {
        // Reset monitoring data from the previous failover.
        self.metrics.requests_in_flight_max.set(self.stats_key(), 0);
        self.metrics.failover_duration_ms.set(self.stats_key(), 0);

        let now = Instant::now();
        inner.last_start = Some(now);
        self.log_error_if_state_not(inner, BufferState::Idle);
        inner.state = BufferState::Buffering;
        inner.queue = Some(VecDeque::new());

        let buffering_deadline = now + self.config.max_failover_duration;
        inner.timeout_worker = Some(TimeoutWorker::spawn(Arc::clone(self), buffering_deadline));

        info!(
            shard = %self.key,
            window = ?self.config.window,
            size = self.config.size,
            max_failover_duration = ?self.config.max_failover_duration,
            cause = %observed_err.map(|e| e.to_string()).unwrap_or_default(),
            "starting buffering"
        );
    }

    /// Transition `Buffering` -> `Draining` and hand the queue to the
    /// drain task. Called with the write lock held; a no-op in any other
    /// state.
    fn stop_buffering(self: &Arc<Self>, inner: &mut Inner, reason: &'static str) {
        if inner.state != BufferState::Buffering {
            return;
        }

        let now = Instant::now();
        inner.last_end = Some(now);
        let duration = inner.last_start.map(|start| now - start).unwrap_or_default();
        self.metrics
            .failover_duration_ms
            .set(self.stats_key(), duration.as_millis() as i64);

        inner.state = BufferState::Draining;
        // Clear the queue so remove() and evict_oldest() cannot touch
        // entries that now belong to the drain.
        let queue = inner.queue.take().unwrap_or_default();
        let worker = inner.timeout_worker.take();

        info!(
            shard = %self.key,
            after = ?duration,
            reason,
            queued = queue.len(),
            "stopping buffering, draining queued requests"
        );

        let buffer = Arc::clone(self);
        tokio::spawn(async move {
            buffer.drain(queue, worker).await;
        });
    }

    /// Release every queued entry, then return the buffer to `Idle`.
    async fn drain(self: Arc<Self>, queue: VecDeque<Arc<Entry>>, worker: Option<TimeoutWorker>) {
        // Stop the worker outside the lock; it may be blocked on the lock
        // itself while re-checking a head entry.
        if let Some(worker) = worker {
            worker.stop().await;
        }

        let start = Instant::now();
        let drained = queue.len();
        let concurrency = self.config.drain_concurrency.max(1);

        if concurrency <= 1 || drained <= 1 {
            for entry in &queue {
                self.release_and_wait(entry, None).await;
            }
        } else {
            let entries: Vec<Arc<Entry>> = queue.into_iter().collect();
            let chunk_size = entries.len().div_ceil(concurrency);
            let mut tasks = JoinSet::new();
            for chunk in entries.chunks(chunk_size) {
                let chunk = chunk.to_vec();
                let buffer = Arc::clone(&self);
                tasks.spawn(async move {
                    for entry in &chunk {
                        buffer.release_and_wait(entry, None).await;
                    }
                });
            }
            while tasks.join_next().await.is_some() {}
        }

        if drained > 0 {
            self.metrics
                .requests_drained
                .inc_by(self.stats_key(), drained as u64);
        }
        info!(
            shard = %self.key,
            drained,
            took = ?start.elapsed(),
            "draining finished"
        );

        let mut inner = self.inner.write();
        self.log_error_if_state_not(&inner, BufferState::Draining);
        inner.state = BufferState::Idle;
    }

    /// Unblock a request that has already been taken off the queue, wait
    /// until it acknowledged the release, then free its budget slot.
    async fn release_and_wait(&self, entry: &Entry, err: Option<Error>) {
        let tx = entry.done.lock().take();
        match tx {
            Some(tx) => {
                // The send fails if the waiter already departed on its own
                // context; the acknowledgement below covers that case too.
                let _ = tx.send(err);
            }
            None => {
                error!(
                    shard = %self.key,
                    backtrace = %Backtrace::force_capture(),
                    "BUG: request was already unblocked"
                );
            }
        }
        entry.release_token.cancelled().await;
        drop(entry.slot.lock().take());
    }

    /// Log (never panic) when the state machine is not where it should
    /// be. This code is on the critical path of every query; continuing
    /// with a degraded buffer beats crash-looping the proxy.
    fn log_error_if_state_not(&self, inner: &Inner, expected: BufferState) {
        if inner.state != expected {
            error!(
                shard = %self.key,
                expected = %expected,
                actual = %inner.state,
                backtrace = %Backtrace::force_capture(),
                "BUG: unexpected buffer state"
            );
        }
    }

    fn stats_key(&self) -> [&str; 2] {
        [self.key.keyspace.as_str(), self.key.shard.as_str()]
    }
}

/// Decision table for buffering, evaluated under the lock.
fn should_buffer(state: BufferState, failover_detected: bool) -> bool {
    match (state, failover_detected) {
        // No failover in progress.
        (BufferState::Idle, false) => false,
        // Not buffering yet, but a new failover was detected.
        (BufferState::Idle, true) => true,
        // Failover in progress; every request on the shard is held.
        (BufferState::Buffering, _) => true,
        // Draining: requests unrelated to the failover pass through.
        (BufferState::Draining, false) => false,
        // Race between a request that saw a failover error and the end of
        // the failover. Do not buffer; the caller retries immediately.
        (BufferState::Draining, true) => false,
    }
}

/// Gate for logs that would otherwise repeat on every request.
#[derive(Debug)]
struct ThrottledLog {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl ThrottledLog {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// True at most once per interval.
    fn should_log(&self) -> bool {
        let mut last = self.last.lock();
        let now = Instant::now();
        match *last {
            Some(prev) if now - prev < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
