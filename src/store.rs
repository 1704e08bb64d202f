//! # The Commit Store Contract
//!
//! [`CommitStore`] is the seam between the client-side pieces
//! ([`OptimisticEventStream`](crate::OptimisticEventStream),
//! [`CommitPoller`](crate::CommitPoller)) and a storage engine. Two engines
//! ship with the crate:
//!
//! | Engine | Conflict detection | Checkpoint source |
//! |--------|--------------------|-------------------|
//! | [`InMemoryCommitStore`](crate::InMemoryCommitStore) | per-stream `Mutex` | `AtomicI64` |
//! | [`SqliteCommitStore`](crate::SqliteCommitStore) | unique indexes in one transaction | `AUTOINCREMENT` |
//!
//! ## Write Path
//!
//! ```text
//! commit(attempt)
//!   ├── (bucket, stream, commit_id) exists?       → Error::DuplicateCommit
//!   ├── (bucket, stream, commit_sequence) exists? → Error::Concurrency
//!   ├── sequence/revision does not extend stream? → Error::InvalidAttempt
//!   ├── assign next checkpoint, append
//!   └── update stream head (may lag the append)
//! ```
//!
//! ## Read Path
//!
//! `get_from_checkpoint` is a stateless cursor: every call scans the current
//! durable state for checkpoints strictly greater than the argument. Because
//! checkpoints are assigned at insertion, a scan may observe `k + 1` while
//! `k` is still in flight. Consumers that need gap-free order put a
//! [`Sequencer`](crate::Sequencer) in front of the feed.

use crate::error::Result;
use crate::types::{BucketId, Checkpoint, Commit, CommitAttempt, Snapshot, StreamHead, StreamId};

/// A lazily evaluated sequence of commits.
///
/// Engines page through storage as the iterator is consumed, so a caller that
/// stops early never loads the rest of the feed. Each call to a read method
/// returns an independent iterator; two enumerations never share position.
pub type Commits<'a> = Box<dyn Iterator<Item = Result<Commit>> + Send + 'a>;

/// Persistence contract for commits, stream heads and snapshots.
///
/// Every method fails with [`Error::Disposed`](crate::Error::Disposed) once
/// [`CommitStore::dispose`] has been called.
///
/// # Thread Safety
///
/// Implementations are `Send + Sync` and are shared as `Arc<dyn CommitStore>`.
/// `commit` is linearizable per `(bucket, stream)`; commits to different
/// streams never wait on each other beyond checkpoint assignment.
pub trait CommitStore: Send + Sync {
    /// Prepares storage. Idempotent and safe to call from several threads.
    fn initialize(&self) -> Result<()>;

    /// Appends a commit and returns it with its assigned checkpoint.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateCommit`](crate::Error::DuplicateCommit) if the commit id is already persisted for the stream
    /// - [`Error::Concurrency`](crate::Error::Concurrency) if the sequence slot is taken
    /// - [`Error::InvalidAttempt`](crate::Error::InvalidAttempt) if the attempt does not extend the stream
    fn commit(&self, attempt: CommitAttempt) -> Result<Commit>;

    /// Commits of one stream whose event range intersects
    /// `[min_revision, max_revision]`, ascending by commit sequence.
    fn get_from(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Vec<Commit>>;

    /// All commits with a checkpoint strictly greater than `checkpoint`,
    /// ascending. Lazy and paged.
    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Commits<'_>>;

    /// Like [`CommitStore::get_from_checkpoint`], restricted to one bucket.
    fn get_from_bucket_checkpoint(&self, bucket_id: &BucketId, checkpoint: Checkpoint) -> Result<Commits<'_>>;

    /// Commits not yet marked as dispatched, ascending by checkpoint.
    fn get_undispatched_commits(&self) -> Result<Commits<'_>>;

    /// Sets the dispatch flag of a persisted commit.
    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()>;

    /// Current head of a stream, if it has one.
    fn get_stream_head(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<Option<StreamHead>>;

    /// Newest snapshot at or below `max_revision`.
    fn get_snapshot(&self, bucket_id: &BucketId, stream_id: &StreamId, max_revision: u64) -> Result<Option<Snapshot>>;

    /// Stores a snapshot and recomputes the head's unsnapshotted count.
    ///
    /// Returns `false` and leaves storage unchanged when a snapshot already
    /// exists at that exact revision, or when the stream has no head.
    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool>;

    /// Heads of `bucket_id` with at least `threshold` unsnapshotted events,
    /// largest backlog first.
    fn get_streams_to_snapshot(&self, bucket_id: &BucketId, threshold: u64) -> Result<Vec<StreamHead>>;

    /// Removes the commits, head and snapshots of one stream.
    fn delete_stream(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<()>;

    /// Removes everything stored under one bucket.
    fn purge_bucket(&self, bucket_id: &BucketId) -> Result<()>;

    /// Removes everything. Checkpoints are not rewound.
    fn purge(&self) -> Result<()>;

    /// Releases resources. Every later call fails with `Error::Disposed`.
    fn dispose(&self) -> Result<()>;

    /// Returns true once [`CommitStore::dispose`] has been called.
    fn is_disposed(&self) -> bool;
}
