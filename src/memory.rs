//! # In-Memory Commit Store
//!
//! A complete [`CommitStore`] held in process memory. It is the reference
//! engine for tests and for hosts that rebuild state on start.
//!
//! ## Locking Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ streams: RwLock<HashMap<(bucket, stream), Arc<Mutex<StreamLog>>>> │
//! │          map lock held only to find or create a stream's log      │
//! │                                                                  │
//! │   StreamLog (per-stream Mutex)                                   │
//! │   ├── commits     Vec<Commit>   (index = commit_sequence - 1)    │
//! │   └── commit_ids  HashSet<CommitId>                              │
//! │                                                                  │
//! │ last_checkpoint: AtomicI64      one fetch_add per commit         │
//! │ feed: RwLock<BTreeMap<checkpoint, Commit>>                       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Two commits to different streams contend only on the atomic counter and
//! the brief feed insert. A commit that draws checkpoint `k` can insert
//! after a commit that drew `k + 1`, so the feed can show holes. That is
//! the same behavior a SQL engine exhibits and the poller handles it.
//!
//! ## Stream Heads
//!
//! Head updates are pushed to a [`HeadWorker`] and applied off the write
//! path. Operations that report heads flush the queue first.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::Span;

use crate::error::{Error, Result};
use crate::heads::{HeadTable, HeadWorker};
use crate::store::{CommitStore, Commits};
use crate::sync::{lock, read, write};
use crate::types::{BucketId, Checkpoint, Commit, CommitAttempt, CommitId, Snapshot, StreamHead, StreamId, StreamKey};

// =============================================================================
// Configuration
// =============================================================================

/// Default capacity of the stream-head queue.
pub const DEFAULT_HEAD_QUEUE_BOUND: usize = 1024;

/// Default time `dispose` waits for the head worker to drain.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Commits copied out of the feed per lock acquisition.
const FEED_PAGE_SIZE: usize = 256;

/// Configuration for [`InMemoryCommitStore`].
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Capacity of the stream-head queue. Committers block when it is full.
    pub head_queue_bound: usize,

    /// How long `dispose` waits for queued head updates to be applied.
    pub shutdown_timeout: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            head_queue_bound: DEFAULT_HEAD_QUEUE_BOUND,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl MemoryConfig {
    /// Sets the head queue capacity.
    pub fn with_head_queue_bound(mut self, bound: usize) -> Self {
        self.head_queue_bound = bound;
        self
    }

    /// Sets the dispose wait bound.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// =============================================================================
// Store
// =============================================================================

/// Everything persisted for one stream.
#[derive(Debug, Default)]
struct StreamLog {
    commits: Vec<Commit>,
    commit_ids: HashSet<CommitId>,
}

/// A [`CommitStore`] kept entirely in memory.
///
/// # Example
///
/// ```rust
/// use spitelog::{CommitStore, InMemoryCommitStore};
/// use spitelog::types::Checkpoint;
///
/// let store = InMemoryCommitStore::new();
/// store.initialize()?;
/// assert_eq!(store.get_from_checkpoint(Checkpoint::START)?.count(), 0);
/// # Ok::<(), spitelog::Error>(())
/// ```
#[derive(Debug)]
pub struct InMemoryCommitStore {
    config: MemoryConfig,
    streams: RwLock<HashMap<StreamKey, Arc<Mutex<StreamLog>>>>,
    feed: RwLock<BTreeMap<i64, Commit>>,
    /// Last checkpoint handed out. Never rewound, not even by `purge`.
    last_checkpoint: AtomicI64,
    dispatched: Mutex<HashSet<i64>>,
    snapshots: RwLock<HashMap<StreamKey, BTreeMap<u64, Snapshot>>>,
    heads: HeadTable,
    head_worker: HeadWorker,
    disposed: AtomicBool,
    span: Span,
}

impl Default for InMemoryCommitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCommitStore {
    /// Creates an empty store with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Creates an empty store.
    pub fn with_config(config: MemoryConfig) -> Self {
        let span = tracing::info_span!("memory_store");
        let heads = HeadTable::default();
        let head_worker = HeadWorker::spawn(Arc::clone(&heads), config.head_queue_bound, span.clone());

        Self {
            config,
            streams: RwLock::new(HashMap::new()),
            feed: RwLock::new(BTreeMap::new()),
            last_checkpoint: AtomicI64::new(Checkpoint::START.as_raw()),
            dispatched: Mutex::new(HashSet::new()),
            snapshots: RwLock::new(HashMap::new()),
            heads,
            head_worker,
            disposed: AtomicBool::new(false),
            span,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    /// Finds or creates the log of one stream.
    fn stream_log(&self, key: &StreamKey) -> Arc<Mutex<StreamLog>> {
        if let Some(log) = read(&self.streams).get(key) {
            return Arc::clone(log);
        }
        Arc::clone(write(&self.streams).entry(key.clone()).or_default())
    }

    fn feed_pager(&self, after: Checkpoint, filter: FeedFilter) -> Commits<'_> {
        Box::new(FeedPager {
            store: self,
            after: after.as_raw(),
            filter,
            page: VecDeque::new(),
            exhausted: false,
        })
    }

    /// Drops every entity matching `matches`. The checkpoint counter is kept.
    fn remove_where(&self, matches: impl Fn(&BucketId, &StreamId) -> bool) -> Result<()> {
        self.head_worker.flush()?;

        write(&self.streams).retain(|(bucket, stream), _| !matches(bucket, stream));

        let mut removed = Vec::new();
        write(&self.feed).retain(|checkpoint, commit| {
            let keep = !matches(&commit.bucket_id, &commit.stream_id);
            if !keep {
                removed.push(*checkpoint);
            }
            keep
        });

        let mut dispatched = lock(&self.dispatched);
        for checkpoint in removed {
            dispatched.remove(&checkpoint);
        }
        drop(dispatched);

        lock(&self.heads).retain(|(bucket, stream), _| !matches(bucket, stream));
        write(&self.snapshots).retain(|(bucket, stream), _| !matches(bucket, stream));
        Ok(())
    }
}

impl CommitStore for InMemoryCommitStore {
    fn initialize(&self) -> Result<()> {
        self.ensure_open()?;
        tracing::debug!(parent: &self.span, "initialized");
        Ok(())
    }

    fn commit(&self, attempt: CommitAttempt) -> Result<Commit> {
        self.ensure_open()?;
        attempt.validate()?;

        let key = (attempt.bucket_id.clone(), attempt.stream_id.clone());
        let log = self.stream_log(&key);
        let mut log = lock(&log);

        if log.commit_ids.contains(&attempt.commit_id) {
            return Err(Error::DuplicateCommit {
                bucket_id: attempt.bucket_id,
                stream_id: attempt.stream_id,
                commit_id: attempt.commit_id,
            });
        }

        let last_sequence = log.commits.len() as u64;
        if attempt.commit_sequence <= last_sequence {
            return Err(Error::Concurrency {
                bucket_id: attempt.bucket_id,
                stream_id: attempt.stream_id,
                commit_sequence: attempt.commit_sequence,
            });
        }
        if attempt.commit_sequence != last_sequence + 1 {
            return Err(Error::InvalidAttempt(format!(
                "commit sequence {} leaves a gap after {last_sequence}",
                attempt.commit_sequence
            )));
        }

        let last_revision = log.commits.last().map_or(0, |c| c.stream_revision);
        if attempt.previous_revision() != last_revision {
            return Err(Error::InvalidAttempt(format!(
                "commit starts at revision {} but the stream is at {last_revision}",
                attempt.first_revision()
            )));
        }

        let checkpoint = Checkpoint::from_raw(self.last_checkpoint.fetch_add(1, Ordering::AcqRel) + 1);
        let commit = attempt.into_commit(checkpoint);

        log.commit_ids.insert(commit.commit_id.clone());
        log.commits.push(commit.clone());
        write(&self.feed).insert(checkpoint.as_raw(), commit.clone());
        drop(log);

        // The commit is already published; a store disposed meanwhile only
        // loses the head update.
        if let Err(e) = self
            .head_worker
            .record(commit.bucket_id.clone(), commit.stream_id.clone(), commit.stream_revision)
        {
            tracing::warn!(
                parent: &self.span,
                bucket = %commit.bucket_id,
                stream = %commit.stream_id,
                error = %e,
                "stream head not updated"
            );
        }

        tracing::debug!(
            parent: &self.span,
            bucket = %commit.bucket_id,
            stream = %commit.stream_id,
            sequence = commit.commit_sequence,
            checkpoint = checkpoint.as_raw(),
            "committed"
        );
        Ok(commit)
    }

    fn get_from(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Vec<Commit>> {
        self.ensure_open()?;

        let key = (bucket_id.clone(), stream_id.clone());
        let Some(log) = read(&self.streams).get(&key).cloned() else {
            return Ok(Vec::new());
        };
        let log = lock(&log);
        Ok(log
            .commits
            .iter()
            .filter(|commit| commit.intersects(min_revision, max_revision))
            .cloned()
            .collect())
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Commits<'_>> {
        self.ensure_open()?;
        Ok(self.feed_pager(checkpoint, FeedFilter::All))
    }

    fn get_from_bucket_checkpoint(&self, bucket_id: &BucketId, checkpoint: Checkpoint) -> Result<Commits<'_>> {
        self.ensure_open()?;
        Ok(self.feed_pager(checkpoint, FeedFilter::Bucket(bucket_id.clone())))
    }

    fn get_undispatched_commits(&self) -> Result<Commits<'_>> {
        self.ensure_open()?;
        Ok(self.feed_pager(Checkpoint::START, FeedFilter::Undispatched))
    }

    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()> {
        self.ensure_open()?;
        let checkpoint = commit.checkpoint.as_raw();
        if read(&self.feed).contains_key(&checkpoint) {
            lock(&self.dispatched).insert(checkpoint);
        }
        Ok(())
    }

    fn get_stream_head(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<Option<StreamHead>> {
        self.ensure_open()?;
        self.head_worker.flush()?;
        Ok(lock(&self.heads).get(&(bucket_id.clone(), stream_id.clone())).cloned())
    }

    fn get_snapshot(&self, bucket_id: &BucketId, stream_id: &StreamId, max_revision: u64) -> Result<Option<Snapshot>> {
        self.ensure_open()?;
        let snapshots = read(&self.snapshots);
        Ok(snapshots
            .get(&(bucket_id.clone(), stream_id.clone()))
            .and_then(|by_revision| by_revision.range(..=max_revision).next_back())
            .map(|(_, snapshot)| snapshot.clone()))
    }

    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        self.ensure_open()?;
        self.head_worker.flush()?;

        let key = (snapshot.bucket_id.clone(), snapshot.stream_id.clone());
        let mut heads = lock(&self.heads);
        let Some(head) = heads.get_mut(&key) else {
            return Ok(false);
        };

        let mut snapshots = write(&self.snapshots);
        let by_revision = snapshots.entry(key).or_default();
        if by_revision.contains_key(&snapshot.stream_revision) {
            return Ok(false);
        }

        head.snapshot_revision = head.snapshot_revision.max(snapshot.stream_revision);
        tracing::debug!(
            parent: &self.span,
            bucket = %snapshot.bucket_id,
            stream = %snapshot.stream_id,
            revision = snapshot.stream_revision,
            unsnapshotted = head.unsnapshotted(),
            "snapshot added"
        );
        by_revision.insert(snapshot.stream_revision, snapshot);
        Ok(true)
    }

    fn get_streams_to_snapshot(&self, bucket_id: &BucketId, threshold: u64) -> Result<Vec<StreamHead>> {
        self.ensure_open()?;
        self.head_worker.flush()?;

        let mut due: Vec<StreamHead> = lock(&self.heads)
            .values()
            .filter(|head| &head.bucket_id == bucket_id && head.unsnapshotted() >= threshold)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.unsnapshotted()
                .cmp(&a.unsnapshotted())
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });
        Ok(due)
    }

    fn delete_stream(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<()> {
        self.ensure_open()?;
        self.remove_where(|bucket, stream| bucket == bucket_id && stream == stream_id)?;
        tracing::info!(parent: &self.span, bucket = %bucket_id, stream = %stream_id, "stream deleted");
        Ok(())
    }

    fn purge_bucket(&self, bucket_id: &BucketId) -> Result<()> {
        self.ensure_open()?;
        self.remove_where(|bucket, _| bucket == bucket_id)?;
        tracing::info!(parent: &self.span, bucket = %bucket_id, "bucket purged");
        Ok(())
    }

    fn purge(&self) -> Result<()> {
        self.ensure_open()?;
        self.remove_where(|_, _| true)?;
        tracing::info!(parent: &self.span, "store purged");
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.head_worker.shutdown(self.config.shutdown_timeout);
        tracing::info!(parent: &self.span, "disposed");
        Ok(())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Drop for InMemoryCommitStore {
    fn drop(&mut self) {
        self.head_worker.shutdown(self.config.shutdown_timeout);
    }
}

// =============================================================================
// Feed Pager
// =============================================================================

/// Which commits a [`FeedPager`] yields.
#[derive(Debug)]
enum FeedFilter {
    All,
    Bucket(BucketId),
    Undispatched,
}

/// Walks the feed one page at a time, re-taking the read lock per page.
///
/// The cursor is the last checkpoint yielded, so commits inserted behind the
/// cursor while iterating are not seen by this enumeration.
struct FeedPager<'a> {
    store: &'a InMemoryCommitStore,
    after: i64,
    filter: FeedFilter,
    page: VecDeque<Commit>,
    exhausted: bool,
}

impl FeedPager<'_> {
    fn fill(&mut self) {
        let feed = read(&self.store.feed);
        let dispatched = match self.filter {
            FeedFilter::Undispatched => Some(lock(&self.store.dispatched)),
            _ => None,
        };

        let mut scanned = 0;
        for (checkpoint, commit) in feed.range((Bound::Excluded(self.after), Bound::Unbounded)) {
            scanned += 1;
            self.after = *checkpoint;

            let wanted = match &self.filter {
                FeedFilter::All => true,
                FeedFilter::Bucket(bucket_id) => &commit.bucket_id == bucket_id,
                FeedFilter::Undispatched => dispatched.as_ref().is_some_and(|d| !d.contains(checkpoint)),
            };
            if wanted {
                self.page.push_back(commit.clone());
            }
            if scanned == FEED_PAGE_SIZE {
                return;
            }
        }
        self.exhausted = true;
    }
}

impl Iterator for FeedPager<'_> {
    type Item = Result<Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.page.is_empty() && !self.exhausted {
            self.fill();
        }
        self.page.pop_front().map(Ok)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventMessage, Headers};

    fn attempt(stream: &str, sequence: u64, revision: u64, events: usize) -> CommitAttempt {
        CommitAttempt {
            bucket_id: BucketId::default(),
            stream_id: StreamId::new(stream),
            stream_revision: revision,
            commit_id: CommitId::generate(),
            commit_sequence: sequence,
            commit_stamp_ms: 0,
            headers: Headers::new(),
            events: (0..events).map(|_| EventMessage::new(b"e".to_vec())).collect(),
        }
    }

    #[test]
    fn test_checkpoints_are_unique_and_increasing() {
        let store = InMemoryCommitStore::new();
        let a = store.commit(attempt("a", 1, 1, 1)).unwrap();
        let b = store.commit(attempt("b", 1, 2, 2)).unwrap();
        let c = store.commit(attempt("a", 2, 2, 1)).unwrap();

        assert!(a.checkpoint < b.checkpoint && b.checkpoint < c.checkpoint);
    }

    #[test]
    fn test_sequence_gap_is_rejected() {
        let store = InMemoryCommitStore::new();
        store.commit(attempt("s", 1, 1, 1)).unwrap();

        let err = store.commit(attempt("s", 3, 2, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidAttempt(_)));
    }

    #[test]
    fn test_revision_mismatch_is_rejected() {
        let store = InMemoryCommitStore::new();
        store.commit(attempt("s", 1, 2, 2)).unwrap();

        // Claims to start at revision 2, but the stream is already at 2.
        let err = store.commit(attempt("s", 2, 2, 1)).unwrap_err();
        assert!(matches!(err, Error::InvalidAttempt(_)));
    }

    #[test]
    fn test_commit_racing_head_shutdown_still_succeeds() {
        let store = InMemoryCommitStore::new();
        // What a concurrent dispose does between the open check and the publish.
        assert!(store.head_worker.shutdown(Duration::from_secs(1)));

        let commit = store.commit(attempt("s", 1, 1, 1)).unwrap();
        let feed: Vec<Commit> = store
            .get_from_checkpoint(Checkpoint::START)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].commit_id, commit.commit_id);
    }

    #[test]
    fn test_pager_crosses_page_boundaries() {
        let store = InMemoryCommitStore::new();
        let total = FEED_PAGE_SIZE * 2 + 3;
        for sequence in 1..=total as u64 {
            store.commit(attempt("s", sequence, sequence, 1)).unwrap();
        }

        let checkpoints: Vec<i64> = store
            .get_from_checkpoint(Checkpoint::START)
            .unwrap()
            .map(|c| c.unwrap().checkpoint.as_raw())
            .collect();
        assert_eq!(checkpoints.len(), total);
        assert!(checkpoints.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_bucket_feed_skips_other_buckets_across_pages() {
        let store = InMemoryCommitStore::new();
        for sequence in 1..=(FEED_PAGE_SIZE as u64 + 10) {
            store.commit(attempt("noise", sequence, sequence, 1)).unwrap();
        }
        let mut tenant = attempt("s", 1, 1, 1);
        tenant.bucket_id = BucketId::new("tenant");
        store.commit(tenant).unwrap();

        let found: Vec<Commit> = store
            .get_from_bucket_checkpoint(&BucketId::new("tenant"), Checkpoint::START)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bucket_id, BucketId::new("tenant"));
    }

    #[test]
    fn test_purge_does_not_rewind_checkpoints() {
        let store = InMemoryCommitStore::new();
        let before = store.commit(attempt("s", 1, 1, 1)).unwrap();
        store.purge().unwrap();

        let after = store.commit(attempt("s", 1, 1, 1)).unwrap();
        assert!(after.checkpoint > before.checkpoint);
    }

    #[test]
    fn test_dispose_is_idempotent_and_blocks_calls() {
        let store = InMemoryCommitStore::with_config(MemoryConfig::default().with_shutdown_timeout(Duration::from_secs(1)));
        store.dispose().unwrap();
        store.dispose().unwrap();

        assert!(store.is_disposed());
        assert!(matches!(store.commit(attempt("s", 1, 1, 1)), Err(Error::Disposed)));
        assert!(matches!(store.get_from_checkpoint(Checkpoint::START), Err(Error::Disposed)));
    }
}
