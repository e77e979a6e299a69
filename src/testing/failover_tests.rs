//! End-to-end failover scenarios exercising the full buffer: request
//! tasks, health-check observations, the timeout worker, and the drain.

#[cfg(test)]
mod tests {
    use crate::buffer::Buffer;
    use crate::config::BufferConfig;
    use crate::error::{Error, Result};
    use crate::shard_buffer::{BufferState, RetryDone};
    use crate::testing::wait_until;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, thiserror::Error)]
    #[error("failover in progress")]
    struct FailoverErr;

    fn init_logging() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    /// window=10s, globalSize=2, maxFailoverDuration=20s, minGap=1s.
    fn test_config() -> BufferConfig {
        BufferConfig::new(2)
            .with_window(Duration::from_secs(10))
            .with_max_failover_duration(Duration::from_secs(20))
            .with_min_time_between_failovers(Duration::from_secs(1))
    }

    /// Issue a request on its own task, reporting a failover error iff
    /// `failover` is set.
    fn spawn_request(
        buffer: &Arc<Buffer>,
        ctx: &CancellationToken,
        keyspace: &'static str,
        shard: &'static str,
        failover: bool,
    ) -> JoinHandle<Result<Option<RetryDone>>> {
        let buffer = Arc::clone(buffer);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let err = FailoverErr;
            let observed: Option<&(dyn std::error::Error + Send + Sync)> =
                if failover { Some(&err) } else { None };
            buffer
                .wait_for_failover_end(&ctx, keyspace, shard, observed)
                .await
        })
    }

    async fn wait_for_queued(buffer: &Arc<Buffer>, shard: &'static str, n: usize) {
        let b = Arc::clone(buffer);
        assert!(
            wait_until(
                move || b.queued_requests("commerce", shard) == n,
                Duration::from_secs(1)
            )
            .await,
            "shard commerce/{} never reached {} queued requests",
            shard,
            n
        );
    }

    async fn wait_for_idle(buffer: &Arc<Buffer>, shard: &'static str) {
        let b = Arc::clone(buffer);
        assert!(
            wait_until(
                move || b.shard_state("commerce", shard) == Some(BufferState::Idle),
                Duration::from_secs(1)
            )
            .await,
            "shard commerce/{} never drained back to IDLE",
            shard
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_reparent_ends_failover() {
        init_logging();
        let buffer = Arc::new(Buffer::new(test_config()));
        let ctx = CancellationToken::new();

        let request = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;
        assert_eq!(
            buffer.shard_state("commerce", "0"),
            Some(BufferState::Buffering)
        );

        sleep(Duration::from_secs(2)).await;
        buffer.record_reparent_timestamp("commerce", "0", 100);

        let released = request
            .await
            .unwrap()
            .unwrap()
            .expect("request should be released for retry");
        released.done();
        wait_for_idle(&buffer, "0").await;

        let stats = buffer.metrics().shard_snapshot("commerce", "0");
        assert_eq!(stats.requests_buffered, 1);
        assert_eq!(stats.requests_drained, 1);
        assert_eq!(stats.requests_in_flight_max, 1);
        assert!(
            (2000..=2100).contains(&stats.failover_duration_ms),
            "failover duration was {}ms",
            stats.failover_duration_ms
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_under_budget_pressure() {
        init_logging();
        let config = BufferConfig::new(1)
            .with_window(Duration::from_secs(10))
            .with_min_time_between_failovers(Duration::from_secs(1));
        let buffer = Arc::new(Buffer::new(config));
        let ctx = CancellationToken::new();

        let first = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;

        // The budget is exhausted; the newer request on the same shard
        // displaces the oldest one and inherits its slot.
        let second = spawn_request(&buffer, &ctx, "commerce", "0", true);
        let evicted = first.await.unwrap();
        assert!(matches!(evicted, Err(Error::Evicted)));
        assert_eq!(buffer.queued_requests("commerce", "0"), 1);

        buffer.record_reparent_timestamp("commerce", "0", 100);
        let released = second
            .await
            .unwrap()
            .unwrap()
            .expect("second request should be released");
        released.done();
        wait_for_idle(&buffer, "0").await;

        let stats = buffer.metrics().shard_snapshot("commerce", "0");
        assert_eq!(stats.requests_evicted_pressure, 1);
        assert_eq!(stats.requests_drained, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_full_across_shards() {
        init_logging();
        let config = BufferConfig::new(1)
            .with_window(Duration::from_secs(10))
            .with_min_time_between_failovers(Duration::from_secs(1));
        let buffer = Arc::new(Buffer::new(config));
        let ctx = CancellationToken::new();

        let request = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;

        // A different shard with an empty queue of its own cannot steal
        // the slot and is rejected outright.
        let other = buffer
            .wait_for_failover_end(&ctx, "commerce", "1", Some(&FailoverErr))
            .await;
        assert!(matches!(other, Err(Error::Full)));
        assert_eq!(buffer.queued_requests("commerce", "1"), 0);
        assert_eq!(
            buffer.metrics().shard_snapshot("commerce", "1").buffer_full,
            1
        );

        ctx.cancel();
        let canceled = request.await.unwrap();
        assert!(matches!(canceled, Err(Error::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_eviction_by_timeout_worker() {
        init_logging();
        let buffer = Arc::new(Buffer::new(test_config()));
        let ctx = CancellationToken::new();

        let request = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;

        // No reparent arrives; the per-request window runs out first. The
        // waiter sees a regular release, not an error.
        sleep(Duration::from_secs(11)).await;
        let released = request
            .await
            .unwrap()
            .unwrap()
            .expect("window eviction releases without an error");
        released.done();

        assert_eq!(buffer.queued_requests("commerce", "0"), 0);
        assert_eq!(
            buffer.shard_state("commerce", "0"),
            Some(BufferState::Buffering)
        );
        let stats = buffer.metrics().shard_snapshot("commerce", "0");
        assert_eq!(stats.requests_evicted_window, 1);
        assert_eq!(stats.requests_drained, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_stop_for_max_duration() {
        init_logging();
        let buffer = Arc::new(Buffer::new(test_config()));
        let ctx = CancellationToken::new();

        let first = spawn_request(&buffer, &ctx, "commerce", "0", true);
        let second = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 2).await;

        sleep(Duration::from_secs(5)).await;
        buffer.stop_for_max_duration("commerce", "0");

        // Both requests are released without an error; their retries may
        // well fail again at the backend, which is the intended semantics.
        for request in [first, second] {
            let released = request
                .await
                .unwrap()
                .unwrap()
                .expect("released after the forced stop");
            released.done();
        }
        wait_for_idle(&buffer, "0").await;
        assert_eq!(
            buffer.metrics().shard_snapshot("commerce", "0").requests_drained,
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_enforced_by_worker() {
        init_logging();
        // A window longer than the failover bound, so only the overall
        // deadline can fire.
        let config = BufferConfig::new(2)
            .with_window(Duration::from_secs(30))
            .with_max_failover_duration(Duration::from_secs(20))
            .with_min_time_between_failovers(Duration::from_secs(1));
        let buffer = Arc::new(Buffer::new(config));
        let ctx = CancellationToken::new();

        let request = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;

        sleep(Duration::from_secs(21)).await;
        let released = request
            .await
            .unwrap()
            .unwrap()
            .expect("released once the failover ran too long");
        released.done();
        wait_for_idle(&buffer, "0").await;

        let stats = buffer.metrics().shard_snapshot("commerce", "0");
        assert_eq!(stats.requests_drained, 1);
        assert!(
            (20000..=20100).contains(&stats.failover_duration_ms),
            "failover duration was {}ms",
            stats.failover_duration_ms
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_before_failover_end() {
        init_logging();
        let buffer = Arc::new(Buffer::new(test_config()));
        let ctx = CancellationToken::new();

        let request = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;

        sleep(Duration::from_secs(1)).await;
        ctx.cancel();

        let canceled = request.await.unwrap();
        assert!(matches!(canceled, Err(Error::Canceled)));

        // The departed request left the queue, but the failover itself is
        // still in progress.
        assert_eq!(buffer.queued_requests("commerce", "0"), 0);
        assert_eq!(
            buffer.shard_state("commerce", "0"),
            Some(BufferState::Buffering)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_too_recent_passes_through() {
        init_logging();
        let config = BufferConfig::new(2)
            .with_window(Duration::from_secs(10))
            .with_min_time_between_failovers(Duration::from_secs(60));
        let buffer = Arc::new(Buffer::new(config));
        let ctx = CancellationToken::new();

        // A full failover cycle establishes a recent end time.
        let request = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;
        buffer.record_reparent_timestamp("commerce", "0", 100);
        let released = request.await.unwrap().unwrap().expect("released");
        released.done();
        wait_for_idle(&buffer, "0").await;

        // A failover error within the minimum gap passes through.
        sleep(Duration::from_secs(1)).await;
        let passed = buffer
            .wait_for_failover_end(&ctx, "commerce", "0", Some(&FailoverErr))
            .await
            .unwrap();
        assert!(passed.is_none());
        assert_eq!(
            buffer.shard_state("commerce", "0"),
            Some(BufferState::Idle)
        );

        // Once the gap has passed, buffering starts again.
        sleep(Duration::from_secs(61)).await;
        let request = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;
        buffer.record_reparent_timestamp("commerce", "0", 200);
        let released = request.await.unwrap().unwrap().expect("released");
        released.done();
        wait_for_idle(&buffer, "0").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reparent_is_ignored() {
        init_logging();
        let buffer = Arc::new(Buffer::new(test_config()));
        let ctx = CancellationToken::new();

        // The health feed has already reported this shard once.
        buffer.record_reparent_timestamp("commerce", "0", 100);
        assert_eq!(
            buffer.shard_state("commerce", "0"),
            Some(BufferState::Idle)
        );

        let request = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;

        // Repeated and out-of-order observations do not end the failover.
        buffer.record_reparent_timestamp("commerce", "0", 100);
        buffer.record_reparent_timestamp("commerce", "0", 99);
        assert_eq!(
            buffer.shard_state("commerce", "0"),
            Some(BufferState::Buffering)
        );
        let shard = buffer.shard("commerce", "0").unwrap();
        assert_eq!(shard.last_reparent_timestamp(), 100);

        // A strictly newer one does.
        buffer.record_reparent_timestamp("commerce", "0", 101);
        let released = request.await.unwrap().unwrap().expect("released");
        released.done();
        wait_for_idle(&buffer, "0").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_draining_requests_pass_through() {
        init_logging();
        let buffer = Arc::new(Buffer::new(test_config()));
        let ctx = CancellationToken::new();

        let request = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;
        buffer.record_reparent_timestamp("commerce", "0", 100);

        // The drain is still waiting for the released request to
        // acknowledge, so the buffer sits in DRAINING.
        let released = request.await.unwrap().unwrap().expect("released");
        assert_eq!(
            buffer.shard_state("commerce", "0"),
            Some(BufferState::Draining)
        );

        // A late failover error races the end of the failover: it passes
        // through and retries immediately rather than being buffered.
        let passed = buffer
            .wait_for_failover_end(&ctx, "commerce", "0", Some(&FailoverErr))
            .await
            .unwrap();
        assert!(passed.is_none());

        released.done();
        wait_for_idle(&buffer, "0").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_reuses_slot_without_leaking_budget() {
        init_logging();
        let config = BufferConfig::new(1)
            .with_window(Duration::from_secs(10))
            .with_min_time_between_failovers(Duration::from_secs(1));
        let buffer = Arc::new(Buffer::new(config));
        let ctx = CancellationToken::new();

        // Fill the budget, evict under pressure, then drain.
        let first = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;
        let second = spawn_request(&buffer, &ctx, "commerce", "0", true);
        assert!(matches!(first.await.unwrap(), Err(Error::Evicted)));

        buffer.record_reparent_timestamp("commerce", "0", 100);
        let released = second.await.unwrap().unwrap().expect("released");
        released.done();
        wait_for_idle(&buffer, "0").await;

        // The single budget slot must be free again: a different shard
        // can buffer now.
        let request = spawn_request(&buffer, &ctx, "commerce", "1", true);
        wait_for_queued(&buffer, "1", 1).await;
        buffer.record_reparent_timestamp("commerce", "1", 100);
        let released = request.await.unwrap().unwrap().expect("released");
        released.done();
        wait_for_idle(&buffer, "1").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_without_error_buffer_during_failover() {
        init_logging();
        let buffer = Arc::new(Buffer::new(test_config()));
        let ctx = CancellationToken::new();

        let first = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;

        // Once the shard is buffering, requests that saw no error are
        // held as well.
        let second = spawn_request(&buffer, &ctx, "commerce", "0", false);
        wait_for_queued(&buffer, "0", 2).await;

        buffer.record_reparent_timestamp("commerce", "0", 100);
        for request in [first, second] {
            let released = request.await.unwrap().unwrap().expect("released");
            released.done();
        }
        wait_for_idle(&buffer, "0").await;
        assert_eq!(
            buffer.metrics().shard_snapshot("commerce", "0").requests_drained,
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_is_idempotent() {
        init_logging();
        let buffer = Arc::new(Buffer::new(test_config()));
        let ctx = CancellationToken::new();

        let request = spawn_request(&buffer, &ctx, "commerce", "0", true);
        wait_for_queued(&buffer, "0", 1).await;

        let shard = buffer.shard("commerce", "0").unwrap();
        let entry = shard.oldest_entry().unwrap();

        // The waiter removes itself on cancellation; further removals of
        // the same entry are no-ops.
        ctx.cancel();
        assert!(matches!(request.await.unwrap(), Err(Error::Canceled)));
        shard.remove(&entry);
        shard.remove(&entry);

        assert_eq!(shard.queued_requests(), 0);
        assert_eq!(shard.state(), BufferState::Buffering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_drain_releases_everything() {
        init_logging();
        let config = BufferConfig::new(10)
            .with_window(Duration::from_secs(10))
            .with_min_time_between_failovers(Duration::from_secs(1))
            .with_drain_concurrency(4);
        let buffer = Arc::new(Buffer::new(config));
        let ctx = CancellationToken::new();

        let requests: Vec<_> = (0..8)
            .map(|_| spawn_request(&buffer, &ctx, "commerce", "0", true))
            .collect();
        wait_for_queued(&buffer, "0", 8).await;

        buffer.record_reparent_timestamp("commerce", "0", 100);
        for request in requests {
            let released = request.await.unwrap().unwrap().expect("released");
            released.done();
        }
        wait_for_idle(&buffer, "0").await;
        assert_eq!(
            buffer.metrics().shard_snapshot("commerce", "0").requests_drained,
            8
        );
    }
}
