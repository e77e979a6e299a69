//! Test support for the failover buffer.
//!
//! The buffer's interesting behavior only shows up with several tasks
//! racing one shard: request tasks, the health-check feed, the timeout
//! worker, and the drain. The end-to-end scenarios live in
//! [`failover_tests`]; this module holds the small helpers they share.

mod failover_tests;

use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Poll `condition` until it holds or `timeout` elapses. Returns the last
/// observed value of the condition.
///
/// Polls once per millisecond, which also works under a paused test clock:
/// each poll gives the runtime a point to advance virtual time.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(1)).await;
    }
    condition()
}
