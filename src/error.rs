//! Error types for the failover buffer.

use thiserror::Error;

/// Result type alias for buffer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to a request that asked to be buffered.
#[derive(Error, Debug)]
pub enum Error {
    /// The global buffer budget is exhausted and this shard has no queued
    /// request of its own to evict.
    #[error("buffer full: too many buffered requests across all shards")]
    Full,

    /// The request was evicted from the buffer to make room for a newer
    /// request on the same shard.
    #[error("buffered request evicted to make room for a newer request")]
    Evicted,

    /// The caller's context was canceled while the request was buffered.
    #[error("context was canceled before failover finished")]
    Canceled,

    /// Internal invariant violation. Logged at the source; surfaced only
    /// when there is no safer way to answer the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may reasonably retry the request at the
    /// application layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Evicted | Error::Canceled)
    }
}
