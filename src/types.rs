//! # Domain Types for SpiteLog
//!
//! This module defines the core types used throughout SpiteLog: identifiers
//! for buckets, streams and commits, the global [`Checkpoint`], and the
//! records that move through the store ([`CommitAttempt`], [`Commit`],
//! [`StreamHead`], [`Snapshot`]).
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Identifiers are wrapped in single-field structs so a bucket id can never
//! be passed where a stream id is expected, and a checkpoint can never be
//! confused with a stream revision.
//!
//! ## Invariants
//!
//! - [`Checkpoint`]: strictly increasing store-wide, never reused, assigned
//!   at insertion time (so a higher value may become visible first)
//! - `commit_sequence`: per stream, starts at 1, contiguous
//! - `stream_revision`: cumulative event count reached by a commit

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest revision accepted by range reads.
///
/// Capped at `i64::MAX` so every revision fits an SQLite INTEGER.
pub const MAX_REVISION: u64 = i64::MAX as u64;

/// Header map carried by commits and events.
///
/// `BTreeMap` keeps keys sorted, so serialized headers are byte-stable.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// `(bucket, stream)` pair used as a map key by the engines.
pub(crate) type StreamKey = (BucketId, StreamId);

// =============================================================================
// Identifiers
// =============================================================================

/// A tenant or partition that groups streams.
///
/// Streams with the same id in different buckets are unrelated.
///
/// # Example
///
/// ```rust
/// use spitelog::types::BucketId;
///
/// assert_eq!(BucketId::default().as_str(), "default");
/// assert_eq!(BucketId::new("tenant-7").to_string(), "tenant-7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketId(String);

impl BucketId {
    /// Name of the bucket used when the caller does not partition.
    pub const DEFAULT: &'static str = "default";

    /// Creates a bucket id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this bucket id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BucketId {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BucketId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for BucketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The identity of an aggregate whose events form one stream.
///
/// For example `"order-abc-123"` holds every event of that order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a new stream ID from a string.
    ///
    /// # Rust Pattern: impl Into<String>
    ///
    /// Accepting `impl Into<String>` means callers can pass either `&str` or
    /// `String` and the conversion happens automatically.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this stream ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The idempotency key of one logical write attempt.
///
/// Retrying a write after a timeout must reuse the same `CommitId`; the
/// store then answers with [`Error::DuplicateCommit`] instead of writing
/// the events twice.
///
/// # Example
///
/// ```rust
/// use spitelog::types::CommitId;
///
/// let fixed = CommitId::new("550e8400-e29b-41d4-a716-446655440000");
/// let fresh = CommitId::generate();
/// assert_ne!(fixed, fresh);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId(String);

impl CommitId {
    /// Creates a commit id from a caller-chosen string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a fresh random (v4 UUID) commit id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommitId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CommitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Checkpoints
// =============================================================================

/// A position in the store-wide commit feed.
///
/// # Invariants
///
/// - Strictly increases with each persisted commit, across all buckets
/// - Never reused, even after purge
/// - Assigned at insertion, not reserved in program order: under concurrent
///   writers checkpoint `k + 1` can become readable before `k`
///
/// `Checkpoint::START` (0) means "before the first commit"; reading from it
/// returns the whole feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Checkpoint(i64);

impl Checkpoint {
    /// The position before any commit.
    pub const START: Checkpoint = Checkpoint(0);

    /// Creates a checkpoint from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value for storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// Returns the checkpoint immediately after this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// One domain event inside a commit.
///
/// The body is opaque bytes; SpiteLog never looks inside it. An event with
/// an empty body is ignored by [`OptimisticEventStream::add`](crate::OptimisticEventStream::add).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// The serialized event payload.
    pub body: Vec<u8>,

    /// Per-event headers (correlation ids, event type, ...).
    #[serde(default)]
    pub headers: Headers,
}

impl EventMessage {
    /// Creates an event with a body and no headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
        }
    }

    /// Adds a header to this event (builder pattern).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Returns true if the body carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

// =============================================================================
// Commits
// =============================================================================

/// A write request built by an event stream and submitted to the store.
///
/// Same shape as [`Commit`] minus the checkpoint, which only the store can
/// assign.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitAttempt {
    /// Bucket of the target stream.
    pub bucket_id: BucketId,
    /// Target stream.
    pub stream_id: StreamId,
    /// Revision the stream reaches once this commit lands.
    pub stream_revision: u64,
    /// Idempotency key.
    pub commit_id: CommitId,
    /// Position this commit claims within the stream (1-based).
    pub commit_sequence: u64,
    /// Wall-clock time of the attempt (Unix milliseconds).
    pub commit_stamp_ms: u64,
    /// Commit-level headers.
    pub headers: Headers,
    /// The events, in order.
    pub events: Vec<EventMessage>,
}

impl CommitAttempt {
    /// Checks the arithmetic every engine relies on.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAttempt`] when the attempt carries no events, claims
    /// sequence 0, or its revision is smaller than its event count.
    pub fn validate(&self) -> Result<()> {
        if self.events.is_empty() {
            return Err(Error::InvalidAttempt(format!(
                "commit '{}' on {}/{} has no events",
                self.commit_id, self.bucket_id, self.stream_id
            )));
        }
        if self.commit_sequence == 0 {
            return Err(Error::InvalidAttempt(format!(
                "commit '{}' claims sequence 0; sequences start at 1",
                self.commit_id
            )));
        }
        if self.stream_revision < self.events.len() as u64 || self.stream_revision > MAX_REVISION {
            return Err(Error::InvalidAttempt(format!(
                "commit '{}' reaches revision {} with {} events",
                self.commit_id,
                self.stream_revision,
                self.events.len()
            )));
        }
        Ok(())
    }

    /// Revision of the first event in this attempt.
    pub fn first_revision(&self) -> u64 {
        self.stream_revision + 1 - self.events.len() as u64
    }

    /// Revision the stream must be at for this attempt to extend it.
    pub fn previous_revision(&self) -> u64 {
        self.stream_revision - self.events.len() as u64
    }

    /// Turns the attempt into a persisted commit at `checkpoint`.
    pub fn into_commit(self, checkpoint: Checkpoint) -> Commit {
        Commit {
            bucket_id: self.bucket_id,
            stream_id: self.stream_id,
            stream_revision: self.stream_revision,
            commit_id: self.commit_id,
            commit_sequence: self.commit_sequence,
            commit_stamp_ms: self.commit_stamp_ms,
            checkpoint,
            headers: self.headers,
            events: self.events,
        }
    }
}

/// A persisted batch of events. Immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// Bucket of the stream.
    pub bucket_id: BucketId,
    /// The stream this commit extends.
    pub stream_id: StreamId,
    /// Revision reached by this commit.
    pub stream_revision: u64,
    /// Idempotency key.
    pub commit_id: CommitId,
    /// Position within the stream (1-based, contiguous).
    pub commit_sequence: u64,
    /// Wall-clock time of the attempt (Unix milliseconds).
    pub commit_stamp_ms: u64,
    /// Store-wide position assigned at insertion.
    pub checkpoint: Checkpoint,
    /// Commit-level headers.
    pub headers: Headers,
    /// The events, in order.
    pub events: Vec<EventMessage>,
}

impl Commit {
    /// Revision of the first event in this commit.
    pub fn first_revision(&self) -> u64 {
        self.stream_revision + 1 - self.events.len() as u64
    }

    /// Returns true if this commit's event range intersects `[min, max]`.
    pub fn intersects(&self, min_revision: u64, max_revision: u64) -> bool {
        self.stream_revision >= min_revision && self.first_revision() <= max_revision
    }
}

// =============================================================================
// Stream Heads and Snapshots
// =============================================================================

/// Per-stream bookkeeping used to schedule snapshots.
///
/// Eventually consistent with the commit log: an engine may apply head
/// updates off the write path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHead {
    /// Bucket of the stream.
    pub bucket_id: BucketId,
    /// The stream.
    pub stream_id: StreamId,
    /// Highest revision committed.
    pub head_revision: u64,
    /// Revision of the newest snapshot (0 if none).
    pub snapshot_revision: u64,
}

impl StreamHead {
    /// Creates a head with no snapshot.
    pub fn new(bucket_id: BucketId, stream_id: StreamId, head_revision: u64) -> Self {
        Self {
            bucket_id,
            stream_id,
            head_revision,
            snapshot_revision: 0,
        }
    }

    /// Events committed since the newest snapshot.
    pub fn unsnapshotted(&self) -> u64 {
        self.head_revision.saturating_sub(self.snapshot_revision)
    }
}

/// Materialized aggregate state at a stream revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Bucket of the stream.
    pub bucket_id: BucketId,
    /// The stream.
    pub stream_id: StreamId,
    /// Revision the payload reflects.
    pub stream_revision: u64,
    /// Opaque state bytes, typically produced by a [`Serializer`](crate::Serializer).
    pub payload: Vec<u8>,
}

impl Snapshot {
    /// Creates a snapshot.
    pub fn new(
        bucket_id: impl Into<BucketId>,
        stream_id: impl Into<StreamId>,
        stream_revision: u64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            stream_revision,
            payload: payload.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
