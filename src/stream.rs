//! # Optimistic Event Stream
//!
//! Client-side view of one stream: the events committed so far plus a buffer
//! of events waiting to be committed. Nothing is locked while the caller
//! decides what to append; conflicts are detected by the store when the
//! buffer is committed.
//!
//! ## State Machine
//!
//! ```text
//!            add(event)                     commit_changes() Ok
//!   Clean ─────────────────► Dirty ──────────────────────────► Clean(revision + n)
//!     ▲                        │
//!     └──── clear_changes() ───┤
//!                              │ commit_changes() Err(Concurrency)
//!                              ▼
//!                   Dirty(revision = latest known)
//! ```
//!
//! After a conflict the stream has already folded the competitor's commits,
//! so the caller can re-run its decision against fresh state and commit
//! again. The uncommitted buffer is kept; the caller decides whether it is
//! still valid.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::serialization::current_time_ms;
use crate::store::CommitStore;
use crate::types::{BucketId, Commit, CommitAttempt, CommitId, EventMessage, Headers, Snapshot, StreamId, MAX_REVISION};

/// A stream opened for reading and optimistic appending.
///
/// Not thread-safe by design: one stream instance belongs to one unit of
/// work. Open another instance to work on the same stream elsewhere.
pub struct OptimisticEventStream {
    store: Arc<dyn CommitStore>,
    bucket_id: BucketId,
    stream_id: StreamId,
    stream_revision: u64,
    commit_sequence: u64,
    committed_events: Vec<EventMessage>,
    committed_headers: Headers,
    uncommitted_events: Vec<EventMessage>,
    uncommitted_headers: Headers,
    identifiers: HashSet<CommitId>,
}

impl OptimisticEventStream {
    /// Creates a stream with no history.
    pub fn new(store: Arc<dyn CommitStore>, bucket_id: BucketId, stream_id: StreamId) -> Self {
        Self {
            store,
            bucket_id,
            stream_id,
            stream_revision: 0,
            commit_sequence: 0,
            committed_events: Vec::new(),
            committed_headers: Headers::new(),
            uncommitted_events: Vec::new(),
            uncommitted_headers: Headers::new(),
            identifiers: HashSet::new(),
        }
    }

    /// Opens a stream, loading the events in `[min_revision, max_revision]`.
    ///
    /// # Errors
    ///
    /// [`Error::StreamNotFound`] if `min_revision > 0` and nothing was found.
    pub fn open(
        store: Arc<dyn CommitStore>,
        bucket_id: BucketId,
        stream_id: StreamId,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Self> {
        let commits = store.get_from(&bucket_id, &stream_id, min_revision, max_revision)?;
        let mut stream = Self::new(store, bucket_id, stream_id);
        stream.populate(min_revision, max_revision, &commits);

        if min_revision > 0 && stream.committed_events.is_empty() {
            return Err(Error::StreamNotFound {
                bucket_id: stream.bucket_id,
                stream_id: stream.stream_id,
            });
        }
        Ok(stream)
    }

    /// Opens a stream positioned at a snapshot, loading the events after it
    /// up to `max_revision`.
    ///
    /// The committed event list starts empty: the snapshot payload stands
    /// for everything up to its revision.
    pub fn open_from_snapshot(store: Arc<dyn CommitStore>, snapshot: &Snapshot, max_revision: u64) -> Result<Self> {
        let from = snapshot.stream_revision + 1;
        let commits = store.get_from(&snapshot.bucket_id, &snapshot.stream_id, from, max_revision)?;

        let mut stream = Self::new(store, snapshot.bucket_id.clone(), snapshot.stream_id.clone());
        stream.stream_revision = snapshot.stream_revision;
        stream.populate(from, max_revision, &commits);

        // The commit sequence is not recorded in the snapshot; without a
        // later commit to learn it from, ask the store for the last one.
        if commits.is_empty() {
            let last = stream
                .store
                .get_from(&stream.bucket_id, &stream.stream_id, snapshot.stream_revision, snapshot.stream_revision)?;
            if let Some(commit) = last.last() {
                stream.commit_sequence = commit.commit_sequence;
                stream.identifiers.insert(commit.commit_id.clone());
            }
        }
        Ok(stream)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Bucket of the stream.
    pub fn bucket_id(&self) -> &BucketId {
        &self.bucket_id
    }

    /// The stream's id.
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Revision of the last committed event known to this instance.
    pub fn stream_revision(&self) -> u64 {
        self.stream_revision
    }

    /// Sequence of the last commit known to this instance.
    pub fn commit_sequence(&self) -> u64 {
        self.commit_sequence
    }

    /// Events loaded from the store or committed through this instance.
    pub fn committed_events(&self) -> &[EventMessage] {
        &self.committed_events
    }

    /// Merged headers of every folded commit (later commits win).
    pub fn committed_headers(&self) -> &Headers {
        &self.committed_headers
    }

    /// Events waiting for [`OptimisticEventStream::commit_changes`].
    pub fn uncommitted_events(&self) -> &[EventMessage] {
        &self.uncommitted_events
    }

    /// Headers that will be attached to the next commit.
    pub fn uncommitted_headers(&self) -> &Headers {
        &self.uncommitted_headers
    }

    /// Mutable access to the next commit's headers.
    pub fn uncommitted_headers_mut(&mut self) -> &mut Headers {
        &mut self.uncommitted_headers
    }

    /// True if there are events waiting to be committed.
    pub fn has_changes(&self) -> bool {
        !self.uncommitted_events.is_empty()
    }

    // =========================================================================
    // Changes
    // =========================================================================

    /// Buffers an event. An event with an empty body is ignored.
    pub fn add(&mut self, event: EventMessage) {
        if event.is_empty() {
            return;
        }
        self.uncommitted_events.push(event);
    }

    /// Sets a header on the next commit.
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.uncommitted_headers.insert(key.into(), value.into());
    }

    /// Drops the buffered events and headers.
    pub fn clear_changes(&mut self) {
        self.uncommitted_events.clear();
        self.uncommitted_headers.clear();
    }

    /// Commits the buffered events as one commit.
    ///
    /// Returns `Ok(None)` when there is nothing to commit.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateCommit`] if `commit_id` was already seen on this
    ///   stream (nothing is sent to the store) or the store reports it
    /// - [`Error::Concurrency`] if another writer got there first; the stream
    ///   still holds the buffered events and has been refreshed with the
    ///   competing commits. If that refresh read fails it is only logged and
    ///   the stream stays stale, so the next commit conflicts again and
    ///   retries the refresh.
    pub fn commit_changes(&mut self, commit_id: CommitId) -> Result<Option<Commit>> {
        if !self.has_changes() {
            return Ok(None);
        }
        if self.identifiers.contains(&commit_id) {
            return Err(Error::DuplicateCommit {
                bucket_id: self.bucket_id.clone(),
                stream_id: self.stream_id.clone(),
                commit_id,
            });
        }

        let attempt = CommitAttempt {
            bucket_id: self.bucket_id.clone(),
            stream_id: self.stream_id.clone(),
            stream_revision: self.stream_revision + self.uncommitted_events.len() as u64,
            commit_id,
            commit_sequence: self.commit_sequence + 1,
            commit_stamp_ms: current_time_ms(),
            headers: self.uncommitted_headers.clone(),
            events: self.uncommitted_events.clone(),
        };

        match self.store.commit(attempt) {
            Ok(commit) => {
                let from = self.stream_revision + 1;
                self.populate(from, MAX_REVISION, std::slice::from_ref(&commit));
                self.clear_changes();
                Ok(Some(commit))
            }
            Err(conflict @ Error::Concurrency { .. }) => {
                tracing::debug!(
                    bucket = %self.bucket_id,
                    stream = %self.stream_id,
                    revision = self.stream_revision,
                    "concurrency conflict, refreshing stream"
                );
                let from = self.stream_revision + 1;
                match self.store.get_from(&self.bucket_id, &self.stream_id, from, MAX_REVISION) {
                    Ok(commits) => self.populate(from, MAX_REVISION, &commits),
                    Err(e) => tracing::warn!(
                        bucket = %self.bucket_id,
                        stream = %self.stream_id,
                        error = %e,
                        "failed to refresh stream after conflict"
                    ),
                }
                Err(conflict)
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Folding
    // =========================================================================

    /// Folds commits into the committed state.
    ///
    /// Events at or below the current revision or below `min_revision` are
    /// skipped; folding stops at `max_revision`.
    fn populate(&mut self, min_revision: u64, max_revision: u64, commits: &[Commit]) {
        for commit in commits {
            self.identifiers.insert(commit.commit_id.clone());
            self.commit_sequence = self.commit_sequence.max(commit.commit_sequence);

            let mut revision = commit.first_revision();
            if revision > max_revision {
                break;
            }
            for (key, value) in &commit.headers {
                self.committed_headers.insert(key.clone(), value.clone());
            }

            for event in &commit.events {
                if revision > max_revision {
                    break;
                }
                if revision >= min_revision && revision > self.stream_revision {
                    self.committed_events.push(event.clone());
                    self.stream_revision = revision;
                }
                revision += 1;
            }
        }
    }
}

impl std::fmt::Debug for OptimisticEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticEventStream")
            .field("bucket_id", &self.bucket_id)
            .field("stream_id", &self.stream_id)
            .field("stream_revision", &self.stream_revision)
            .field("commit_sequence", &self.commit_sequence)
            .field("uncommitted", &self.uncommitted_events.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
