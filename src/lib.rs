//! Request buffering for database primary failovers.
//!
//! This crate implements the per-shard request buffer of a database
//! routing proxy. When a shard's primary fails over, no replica can accept
//! writes for a short window; returning errors for every affected request
//! turns that window into an application-level outage. The buffer instead
//! holds affected requests in memory for a bounded time and releases them
//! once a new primary is observed, so clients see a latency bubble rather
//! than a wall of errors.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               request tasks                  │
//! └─────────────────────────────────────────────┘
//!                      │ wait_for_failover_end
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │                   Buffer                     │
//! │  (keyspace, shard) -> ShardBuffer            │──── shared size budget
//! └─────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────────────────────────────────┐     ┌───────────────┐
//! │  ShardBuffer: IDLE / BUFFERING / DRAINING   │◄────│ health checks  │
//! │  queue of waiting requests                  │     │ (reparent ts)  │
//! └─────────────────────────────────────────────┘     └───────────────┘
//!        │                        │
//!        ▼                        ▼
//!   timeout worker            drain task
//!   (window + max duration)   (release after failover)
//! ```
//!
//! Each shard buffer runs a small state machine: `Idle` until a request
//! reports a failover-caused error, `Buffering` while the failover is in
//! progress, `Draining` while the queue is released, then `Idle` again. A
//! per-shard timeout worker bounds how long any single request may wait
//! and how long the failover may run overall; a shared budget bounds the
//! total number of buffered requests across all shards.
//!
//! # Example
//!
//! ```rust,no_run
//! use holdover::{Buffer, BufferConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let buffer = Buffer::new(BufferConfig::default());
//!
//!     // The health-check subsystem feeds reparent observations:
//!     buffer.record_reparent_timestamp("commerce", "-80", 1_700_000_000);
//!
//!     // A request task that just saw a failover error asks to be held:
//!     let ctx = CancellationToken::new();
//!     let failover_err = std::io::Error::other("primary unavailable");
//!     match buffer
//!         .wait_for_failover_end(&ctx, "commerce", "-80", Some(&failover_err))
//!         .await?
//!     {
//!         Some(retry_done) => {
//!             // The failover is over: re-issue the original RPC here,
//!             // then acknowledge.
//!             retry_done.done();
//!         }
//!         None => {
//!             // Not buffered; proceed as usual.
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The buffer is purely in-memory: losing the process loses the queued
//! requests, which is acceptable because callers must honor their own
//! deadlines regardless.

pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod shard_buffer;
pub mod testing;
pub mod types;

mod timeout;

// Re-export the main types for convenience.
pub use buffer::Buffer;
pub use config::BufferConfig;
pub use error::{Error, Result};
pub use metrics::{BufferMetrics, LabeledCounter, LabeledGauge, ShardMetricsSnapshot};
pub use shard_buffer::{BufferState, RetryDone, ShardBuffer};
pub use types::ShardKey;
