//! # Error Handling for SpiteLog
//!
//! This module defines the error types used throughout SpiteLog. A single
//! error enum ([`Error`]) covers every failure mode of the commit store, the
//! optimistic stream and the poller, so callers match in one place.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations.
//! This provides:
//! - Automatic `Display` implementation from the `#[error(...)]` attributes
//! - Automatic `From` implementations from the `#[from]` attributes
//! - Proper error source chaining via `#[source]`
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Conflict | Sequence slot already taken | Rebuild the attempt and retry |
//! | Duplicate | Commit id already persisted | Treat as already applied |
//! | Transient | Database busy or locked | Back off and retry |
//! | Internal | SQLite error, corruption | Log and investigate |
//! | Lifecycle | Store disposed, poller hung | Stop using the handle |

use thiserror::Error;

use crate::types::{BucketId, CommitId, StreamId};

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in SpiteLog operations.
///
/// # Example
///
/// ```rust,ignore
/// use spitelog::{Error, Result};
///
/// fn example(stream: &mut OptimisticEventStream) -> Result<()> {
///     match stream.commit_changes(CommitId::generate()) {
///         Err(Error::Concurrency { .. }) => {
///             // The stream already reflects the winner; re-run business
///             // logic against it and try again.
///         }
///         other => { other?; }
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflict Errors (Client can retry with updated data)
    // =========================================================================

    /// Optimistic concurrency conflict: another writer claimed the commit
    /// sequence first.
    ///
    /// # When This Happens
    ///
    /// Every commit attempt names the `commit_sequence` it wants to occupy.
    /// If a competitor already persisted a commit at that position, the
    /// attempt is rejected. [`OptimisticEventStream`](crate::OptimisticEventStream)
    /// refreshes itself before returning this error, so the caller can
    /// rebuild the attempt against the new revision right away.
    #[error("concurrency conflict on {bucket_id}/{stream_id}: commit sequence {commit_sequence} is already taken")]
    Concurrency {
        /// Bucket of the contested stream
        bucket_id: BucketId,
        /// The contested stream
        stream_id: StreamId,
        /// The sequence the attempt wanted
        commit_sequence: u64,
    },

    // =========================================================================
    // Idempotency (Not an error, but a signal that the write already landed)
    // =========================================================================

    /// The exact commit id was already persisted for this stream.
    ///
    /// This is the idempotent-replay signal: the original write succeeded,
    /// so nothing needs to be done. Never retried automatically.
    #[error("duplicate commit '{commit_id}' on {bucket_id}/{stream_id}: already persisted")]
    DuplicateCommit {
        /// Bucket of the stream
        bucket_id: BucketId,
        /// The stream that already holds the commit
        stream_id: StreamId,
        /// The replayed commit id
        commit_id: CommitId,
    },

    // =========================================================================
    // Caller Errors
    // =========================================================================

    /// A stream was opened from a non-zero revision but holds no commits.
    #[error("stream {bucket_id}/{stream_id} not found")]
    StreamNotFound {
        /// Bucket that was searched
        bucket_id: BucketId,
        /// Stream that was requested
        stream_id: StreamId,
    },

    /// The commit attempt is malformed (no events, zero sequence, a gap
    /// after the stream's last commit, or inconsistent revision arithmetic).
    #[error("invalid commit attempt: {0}")]
    InvalidAttempt(String),

    // =========================================================================
    // Storage Errors
    // =========================================================================

    /// The backend is temporarily unreachable (busy, locked, cannot open).
    ///
    /// # Recovery
    ///
    /// The poller logs this (rate-limited) and retries after its error
    /// backoff. Writers receive it and decide for themselves.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Unexpected storage failure that is not a conflict or duplicate.
    #[error("storage error: {0}")]
    Storage(String),

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `impl From<rusqlite::Error>`, which
    /// lets `?` convert rusqlite errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema version mismatch detected when opening a database.
    #[error("schema error: {0}")]
    Schema(String),

    /// A stored payload does not match its checksum.
    #[error("corrupted commit at checkpoint {checkpoint}: checksum mismatch")]
    Corrupted {
        /// Checkpoint of the damaged row
        checkpoint: i64,
    },

    /// A payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// The store was disposed; every later call fails with this.
    #[error("commit store has been disposed")]
    Disposed,

    /// The poller worker did not exit within the dispose bound.
    #[error("poller '{name}' did not stop within {timeout_ms}ms")]
    PollerTimeout {
        /// Poller name from its configuration
        name: String,
        /// The bound that was exceeded
        timeout_ms: u64,
    },
}

impl Error {
    /// Returns true for failures that are expected to clear on their own.
    ///
    /// Only [`Error::StorageUnavailable`] qualifies. The poller uses this to
    /// pick the log level; it retries every fetch failure regardless.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StorageUnavailable(_))
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify error messages are formatted correctly.
    ///
    /// Error messages appear in logs and user output, so they have to carry
    /// the identifiers an operator needs.
    #[test]
    fn test_error_display() {
        let conflict = Error::Concurrency {
            bucket_id: BucketId::new("tenant-1"),
            stream_id: StreamId::new("order-42"),
            commit_sequence: 3,
        };
        assert_eq!(
            conflict.to_string(),
            "concurrency conflict on tenant-1/order-42: commit sequence 3 is already taken"
        );

        let duplicate = Error::DuplicateCommit {
            bucket_id: BucketId::default(),
            stream_id: StreamId::new("order-42"),
            commit_id: CommitId::new("c-1"),
        };
        assert_eq!(
            duplicate.to_string(),
            "duplicate commit 'c-1' on default/order-42: already persisted"
        );

        let timeout = Error::PollerTimeout {
            name: "projections".to_string(),
            timeout_ms: 500,
        };
        assert_eq!(timeout.to_string(), "poller 'projections' did not stop within 500ms");
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(Error::StorageUnavailable("busy".into()).is_transient());
        assert!(!Error::Storage("boom".into()).is_transient());
        assert!(!Error::Disposed.is_transient());
    }
}
