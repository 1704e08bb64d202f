//! # SQLite Commit Store
//!
//! A durable [`CommitStore`] over one SQLite file.
//!
//! ## Commit Transaction
//!
//! ```text
//! BEGIN IMMEDIATE                       (dialect: write lock up front)
//!   SELECT ... WHERE commit_id = ?      → Error::DuplicateCommit
//!   SELECT last sequence, revision      → Error::Concurrency / InvalidAttempt
//!   INSERT INTO commits                 → checkpoint = last_insert_rowid()
//!   UPSERT stream_heads                 (head_revision = MAX(old, new))
//! COMMIT
//! ```
//!
//! The unique indexes on `(bucket, stream, commit_sequence)` and
//! `(bucket, stream, commit_id)` back the explicit checks: if an insert
//! still trips one, the error is classified the same way.
//!
//! ## Idempotency Cache
//!
//! The most recent commit keys are kept in an LRU cache. A retry of a recent
//! commit is answered with `DuplicateCommit` without touching the database.
//! The cache is a fast path only; the `commit_id` index is the authority.
//!
//! ## Several Stores, One File
//!
//! Stores opened on the same file (in one or several processes) are safe:
//! SQLite admits one write transaction at a time and readers use WAL. A
//! writer that cannot get the lock within `busy_timeout` receives
//! [`Error::StorageUnavailable`].

mod dialect;
mod schema;

pub use dialect::{FeedScope, SqlDialect, SqliteDialect};
pub use schema::Database;

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::Span;

use crate::error::{Error, Result};
use crate::serialization::{compute_checksum, JsonSerializer, Serializer};
use crate::store::{CommitStore, Commits};
use crate::sync::lock;
use crate::types::{BucketId, Checkpoint, Commit, CommitAttempt, CommitId, Headers, Snapshot, StreamHead, StreamId};

use dialect::COMMIT_COLUMNS;

// =============================================================================
// Configuration
// =============================================================================

/// Default number of commits fetched per feed page.
pub const DEFAULT_PAGE_SIZE: usize = 512;

/// Default time a writer waits for SQLite's write lock.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of recent commit keys kept for duplicate detection.
pub const DEFAULT_IDEMPOTENCY_CACHE_SIZE: usize = 10_000;

/// Configuration for [`SqliteCommitStore`].
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Commits fetched per round trip by the feed iterators.
    pub page_size: usize,

    /// How long a statement waits on a locked database before failing with
    /// [`Error::StorageUnavailable`].
    pub busy_timeout: Duration,

    /// Capacity of the recent-commit LRU cache.
    pub idempotency_cache_size: usize,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            idempotency_cache_size: DEFAULT_IDEMPOTENCY_CACHE_SIZE,
        }
    }
}

impl SqliteConfig {
    /// Sets the feed page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets the idempotency cache capacity.
    pub fn with_idempotency_cache_size(mut self, size: usize) -> Self {
        self.idempotency_cache_size = size;
        self
    }
}

// =============================================================================
// Store
// =============================================================================

/// Key of the idempotency cache.
type CommitKey = (BucketId, StreamId, CommitId);

/// A [`CommitStore`] persisted in SQLite.
///
/// # Type Parameters
///
/// - `S`: how headers and events are encoded into blobs
/// - `D`: backend-specific SQL behavior
///
/// # Example
///
/// ```rust
/// use spitelog::{CommitStore, SqliteCommitStore};
///
/// let store = SqliteCommitStore::open_in_memory()?;
/// store.initialize()?;
/// # Ok::<(), spitelog::Error>(())
/// ```
pub struct SqliteCommitStore<S = JsonSerializer, D = SqliteDialect> {
    conn: Mutex<Connection>,
    serializer: S,
    dialect: D,
    config: SqliteConfig,
    recent_commits: Mutex<LruCache<CommitKey, ()>>,
    disposed: AtomicBool,
    span: Span,
}

impl SqliteCommitStore {
    /// Opens (or creates) a store file with the default configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, SqliteConfig::default(), JsonSerializer, SqliteDialect)
    }

    /// Creates a store in an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Self::from_database(db, SqliteConfig::default(), JsonSerializer, SqliteDialect)
    }
}

impl<S: Serializer, D: SqlDialect> SqliteCommitStore<S, D> {
    /// Opens (or creates) a store file.
    ///
    /// # Errors
    ///
    /// - `Error::StorageUnavailable` if the file cannot be opened
    /// - `Error::Schema` if the file was written by another schema version
    pub fn open_with(path: impl AsRef<Path>, config: SqliteConfig, serializer: S, dialect: D) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::open(path).map_err(|e| classify(&dialect, e))?;
        tracing::info!(path = %path.display(), "sqlite commit store opened");
        Self::from_database(db, config, serializer, dialect)
    }

    /// Wraps an initialized database.
    pub fn from_database(db: Database, config: SqliteConfig, serializer: S, dialect: D) -> Result<Self> {
        let conn = db.into_connection();
        conn.busy_timeout(config.busy_timeout)?;

        let capacity = NonZeroUsize::new(config.idempotency_cache_size).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            conn: Mutex::new(conn),
            serializer,
            dialect,
            recent_commits: Mutex::new(LruCache::new(capacity)),
            config,
            disposed: AtomicBool::new(false),
            span: tracing::info_span!("sqlite_store"),
        })
    }

    /// Runs `f` on the connection, mapping transient failures.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        let mut conn = lock(&self.conn);
        f(&mut conn).map_err(|e| classify(&self.dialect, e))
    }

    /// Body of the commit transaction. Returns the assigned checkpoint.
    fn append(&self, tx: &Transaction<'_>, attempt: &CommitAttempt, headers: &[u8], payload: &[u8]) -> Result<i64> {
        let bucket = attempt.bucket_id.as_str();
        let stream = attempt.stream_id.as_str();

        if commit_id_taken(tx, attempt)? {
            return Err(duplicate(attempt));
        }

        let (last_sequence, last_revision): (i64, i64) = tx
            .query_row(
                "SELECT commit_sequence, stream_revision FROM commits
                 WHERE bucket_id = ?1 AND stream_id = ?2
                 ORDER BY commit_sequence DESC LIMIT 1",
                params![bucket, stream],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .unwrap_or((0, 0));
        let (last_sequence, last_revision) = (last_sequence as u64, last_revision as u64);

        if attempt.commit_sequence <= last_sequence {
            return Err(conflict(attempt));
        }
        if attempt.commit_sequence != last_sequence + 1 {
            return Err(Error::InvalidAttempt(format!(
                "commit sequence {} leaves a gap after {last_sequence}",
                attempt.commit_sequence
            )));
        }
        if attempt.previous_revision() != last_revision {
            return Err(Error::InvalidAttempt(format!(
                "commit starts at revision {} but the stream is at {last_revision}",
                attempt.first_revision()
            )));
        }

        let checksum = compute_checksum(&[headers, payload]);
        let inserted = tx.execute(
            "INSERT INTO commits (
                bucket_id, stream_id, stream_revision, items, commit_id,
                commit_sequence, commit_stamp_ms, headers, payload, checksum
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                bucket,
                stream,
                to_sql_int(attempt.stream_revision),
                attempt.events.len() as i64,
                attempt.commit_id.as_str(),
                to_sql_int(attempt.commit_sequence),
                to_sql_int(attempt.commit_stamp_ms),
                headers,
                payload,
                checksum,
            ],
        );
        if let Err(e) = inserted {
            if self.dialect.is_duplicate_key_error(&e) {
                return Err(if commit_id_taken(tx, attempt)? {
                    duplicate(attempt)
                } else {
                    conflict(attempt)
                });
            }
            return Err(e.into());
        }
        let checkpoint = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO stream_heads (bucket_id, stream_id, head_revision, snapshot_revision)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT(bucket_id, stream_id)
             DO UPDATE SET head_revision = MAX(head_revision, excluded.head_revision)",
            params![bucket, stream, to_sql_int(attempt.stream_revision)],
        )?;

        Ok(checkpoint)
    }

    /// Fetches one feed page after `after`.
    fn feed_page(&self, scope: FeedScope, bucket_id: Option<&BucketId>, after: i64) -> Result<Vec<Commit>> {
        let limit = self.config.page_size.max(1) as i64;
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&self.dialect.feed_page_query(scope))?;
            let rows = match bucket_id {
                Some(bucket) => stmt
                    .query_map(params![after, limit, bucket.as_str()], StoredCommit::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
                None => stmt
                    .query_map(params![after, limit], StoredCommit::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?,
            };
            Ok(rows)
        })?;
        rows.into_iter().map(|row| row.decode(&self.serializer)).collect()
    }

    fn pager(&self, scope: FeedScope, bucket_id: Option<BucketId>, after: Checkpoint) -> Result<Commits<'_>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        Ok(Box::new(FeedPager {
            store: self,
            scope,
            bucket_id,
            after: after.as_raw(),
            page: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn forget_cached(&self, matches: impl Fn(&CommitKey) -> bool) {
        let mut cache = lock(&self.recent_commits);
        let doomed: Vec<CommitKey> = cache.iter().map(|(key, _)| key).filter(|key| matches(key)).cloned().collect();
        for key in doomed {
            cache.pop(&key);
        }
    }
}

impl<S: Serializer, D: SqlDialect> CommitStore for SqliteCommitStore<S, D> {
    fn initialize(&self) -> Result<()> {
        self.with_conn(|conn| schema::create_tables(conn))?;
        tracing::debug!(parent: &self.span, "initialized");
        Ok(())
    }

    fn commit(&self, attempt: CommitAttempt) -> Result<Commit> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        attempt.validate()?;

        let key = (attempt.bucket_id.clone(), attempt.stream_id.clone(), attempt.commit_id.clone());
        if lock(&self.recent_commits).contains(&key) {
            return Err(duplicate(&attempt));
        }

        let headers = self.serializer.serialize(&attempt.headers)?;
        let payload = self.serializer.serialize(&attempt.events)?;

        let checkpoint = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(self.dialect.write_transaction())?;
            let checkpoint = self.append(&tx, &attempt, &headers, &payload)?;
            tx.commit()?;
            Ok(checkpoint)
        })?;

        lock(&self.recent_commits).put(key, ());
        tracing::debug!(
            parent: &self.span,
            bucket = %attempt.bucket_id,
            stream = %attempt.stream_id,
            sequence = attempt.commit_sequence,
            checkpoint,
            "committed"
        );
        Ok(attempt.into_commit(Checkpoint::from_raw(checkpoint)))
    }

    fn get_from(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Vec<Commit>> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {COMMIT_COLUMNS} FROM commits
                 WHERE bucket_id = ?1 AND stream_id = ?2
                   AND stream_revision >= ?3 AND stream_revision - items + 1 <= ?4
                 ORDER BY commit_sequence"
            ))?;
            let rows = stmt
                .query_map(
                    params![
                        bucket_id.as_str(),
                        stream_id.as_str(),
                        to_sql_int(min_revision),
                        to_sql_int(max_revision)
                    ],
                    StoredCommit::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(|row| row.decode(&self.serializer)).collect()
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Commits<'_>> {
        self.pager(FeedScope::All, None, checkpoint)
    }

    fn get_from_bucket_checkpoint(&self, bucket_id: &BucketId, checkpoint: Checkpoint) -> Result<Commits<'_>> {
        self.pager(FeedScope::Bucket, Some(bucket_id.clone()), checkpoint)
    }

    fn get_undispatched_commits(&self) -> Result<Commits<'_>> {
        self.pager(FeedScope::Undispatched, None, Checkpoint::START)
    }

    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE commits SET dispatched = 1 WHERE checkpoint_number = ?1",
                [commit.checkpoint.as_raw()],
            )?;
            Ok(())
        })
    }

    fn get_stream_head(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<Option<StreamHead>> {
        self.with_conn(|conn| {
            let head = conn
                .query_row(
                    "SELECT head_revision, snapshot_revision FROM stream_heads
                     WHERE bucket_id = ?1 AND stream_id = ?2",
                    params![bucket_id.as_str(), stream_id.as_str()],
                    |row| {
                        Ok(StreamHead {
                            bucket_id: bucket_id.clone(),
                            stream_id: stream_id.clone(),
                            head_revision: row.get::<_, i64>(0)? as u64,
                            snapshot_revision: row.get::<_, i64>(1)? as u64,
                        })
                    },
                )
                .optional()?;
            Ok(head)
        })
    }

    fn get_snapshot(&self, bucket_id: &BucketId, stream_id: &StreamId, max_revision: u64) -> Result<Option<Snapshot>> {
        self.with_conn(|conn| {
            let snapshot = conn
                .query_row(
                    "SELECT stream_revision, payload FROM snapshots
                     WHERE bucket_id = ?1 AND stream_id = ?2 AND stream_revision <= ?3
                     ORDER BY stream_revision DESC LIMIT 1",
                    params![bucket_id.as_str(), stream_id.as_str(), to_sql_int(max_revision)],
                    |row| {
                        Ok(Snapshot {
                            bucket_id: bucket_id.clone(),
                            stream_id: stream_id.clone(),
                            stream_revision: row.get::<_, i64>(0)? as u64,
                            payload: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(snapshot)
        })
    }

    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        let added = self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(self.dialect.write_transaction())?;
            let bucket = snapshot.bucket_id.as_str();
            let stream = snapshot.stream_id.as_str();
            let revision = to_sql_int(snapshot.stream_revision);

            let has_head = tx
                .query_row(
                    "SELECT 1 FROM stream_heads WHERE bucket_id = ?1 AND stream_id = ?2",
                    params![bucket, stream],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !has_head {
                return Ok(false);
            }

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO snapshots (bucket_id, stream_id, stream_revision, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![bucket, stream, revision, snapshot.payload],
            )?;
            if inserted == 0 {
                return Ok(false);
            }

            tx.execute(
                "UPDATE stream_heads SET snapshot_revision = MAX(snapshot_revision, ?3)
                 WHERE bucket_id = ?1 AND stream_id = ?2",
                params![bucket, stream, revision],
            )?;
            tx.commit()?;
            Ok(true)
        })?;

        if added {
            tracing::debug!(
                parent: &self.span,
                bucket = %snapshot.bucket_id,
                stream = %snapshot.stream_id,
                revision = snapshot.stream_revision,
                "snapshot added"
            );
        }
        Ok(added)
    }

    fn get_streams_to_snapshot(&self, bucket_id: &BucketId, threshold: u64) -> Result<Vec<StreamHead>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT stream_id, head_revision, snapshot_revision FROM stream_heads
                 WHERE bucket_id = ?1 AND MAX(head_revision - snapshot_revision, 0) >= ?2
                 ORDER BY head_revision - snapshot_revision DESC, stream_id",
            )?;
            let heads = stmt
                .query_map(params![bucket_id.as_str(), to_sql_int(threshold)], |row| {
                    Ok(StreamHead {
                        bucket_id: bucket_id.clone(),
                        stream_id: StreamId::new(row.get::<_, String>(0)?),
                        head_revision: row.get::<_, i64>(1)? as u64,
                        snapshot_revision: row.get::<_, i64>(2)? as u64,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(heads)
        })
    }

    fn delete_stream(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(self.dialect.write_transaction())?;
            for table in ["commits", "stream_heads", "snapshots"] {
                tx.execute(
                    &format!("DELETE FROM {table} WHERE bucket_id = ?1 AND stream_id = ?2"),
                    params![bucket_id.as_str(), stream_id.as_str()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;
        self.forget_cached(|(bucket, stream, _)| bucket == bucket_id && stream == stream_id);
        tracing::info!(parent: &self.span, bucket = %bucket_id, stream = %stream_id, "stream deleted");
        Ok(())
    }

    fn purge_bucket(&self, bucket_id: &BucketId) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(self.dialect.write_transaction())?;
            for table in ["commits", "stream_heads", "snapshots"] {
                tx.execute(&format!("DELETE FROM {table} WHERE bucket_id = ?1"), [bucket_id.as_str()])?;
            }
            tx.commit()?;
            Ok(())
        })?;
        self.forget_cached(|(bucket, _, _)| bucket == bucket_id);
        tracing::info!(parent: &self.span, bucket = %bucket_id, "bucket purged");
        Ok(())
    }

    fn purge(&self) -> Result<()> {
        self.with_conn(|conn| {
            // DELETE rather than DROP: sqlite_sequence keeps the checkpoint
            // high-water mark.
            let tx = conn.transaction_with_behavior(self.dialect.write_transaction())?;
            for table in ["commits", "stream_heads", "snapshots"] {
                tx.execute(&format!("DELETE FROM {table}"), [])?;
            }
            tx.commit()?;
            Ok(())
        })?;
        lock(&self.recent_commits).clear();
        tracing::info!(parent: &self.span, "store purged");
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            tracing::info!(parent: &self.span, "disposed");
        }
        Ok(())
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl<S, D> std::fmt::Debug for SqliteCommitStore<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCommitStore")
            .field("config", &self.config)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// A `commits` row before its blobs are verified and decoded.
struct StoredCommit {
    checkpoint: i64,
    bucket_id: String,
    stream_id: String,
    stream_revision: i64,
    commit_id: String,
    commit_sequence: i64,
    commit_stamp_ms: i64,
    headers: Vec<u8>,
    payload: Vec<u8>,
    checksum: Vec<u8>,
}

impl StoredCommit {
    /// Maps a row selected with [`COMMIT_COLUMNS`].
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            checkpoint: row.get(0)?,
            bucket_id: row.get(1)?,
            stream_id: row.get(2)?,
            stream_revision: row.get(3)?,
            commit_id: row.get(4)?,
            commit_sequence: row.get(5)?,
            commit_stamp_ms: row.get(6)?,
            headers: row.get(7)?,
            payload: row.get(8)?,
            checksum: row.get(9)?,
        })
    }

    fn decode<S: Serializer>(self, serializer: &S) -> Result<Commit> {
        if compute_checksum(&[&self.headers, &self.payload]) != self.checksum {
            return Err(Error::Corrupted {
                checkpoint: self.checkpoint,
            });
        }
        let headers: Headers = serializer.deserialize(&self.headers)?;
        Ok(Commit {
            bucket_id: BucketId::from(self.bucket_id),
            stream_id: StreamId::from(self.stream_id),
            stream_revision: self.stream_revision as u64,
            commit_id: CommitId::from(self.commit_id),
            commit_sequence: self.commit_sequence as u64,
            commit_stamp_ms: self.commit_stamp_ms as u64,
            checkpoint: Checkpoint::from_raw(self.checkpoint),
            headers,
            events: serializer.deserialize(&self.payload)?,
        })
    }
}

// =============================================================================
// Feed Pager
// =============================================================================

/// Lazily pages through the commit feed, one query per page.
///
/// The connection lock is taken per page, never across the caller's
/// processing of a commit.
struct FeedPager<'a, S, D> {
    store: &'a SqliteCommitStore<S, D>,
    scope: FeedScope,
    bucket_id: Option<BucketId>,
    after: i64,
    page: VecDeque<Commit>,
    exhausted: bool,
}

impl<S: Serializer, D: SqlDialect> Iterator for FeedPager<'_, S, D> {
    type Item = Result<Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.page.is_empty() && !self.exhausted {
            match self.store.feed_page(self.scope, self.bucket_id.as_ref(), self.after) {
                Ok(commits) => {
                    self.exhausted = commits.len() < self.store.config.page_size.max(1);
                    if let Some(last) = commits.last() {
                        self.after = last.checkpoint.as_raw();
                    }
                    self.page.extend(commits);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.page.pop_front().map(Ok)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Binds a `u64` as an SQLite INTEGER, saturating at `i64::MAX`.
fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn commit_id_taken(tx: &Transaction<'_>, attempt: &CommitAttempt) -> Result<bool> {
    let taken = tx
        .query_row(
            "SELECT 1 FROM commits WHERE bucket_id = ?1 AND stream_id = ?2 AND commit_id = ?3",
            params![
                attempt.bucket_id.as_str(),
                attempt.stream_id.as_str(),
                attempt.commit_id.as_str()
            ],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    Ok(taken)
}

fn duplicate(attempt: &CommitAttempt) -> Error {
    Error::DuplicateCommit {
        bucket_id: attempt.bucket_id.clone(),
        stream_id: attempt.stream_id.clone(),
        commit_id: attempt.commit_id.clone(),
    }
}

fn conflict(attempt: &CommitAttempt) -> Error {
    Error::Concurrency {
        bucket_id: attempt.bucket_id.clone(),
        stream_id: attempt.stream_id.clone(),
        commit_sequence: attempt.commit_sequence,
    }
}

/// Turns busy/locked SQLite failures into `StorageUnavailable`.
fn classify<D: SqlDialect>(dialect: &D, error: Error) -> Error {
    match error {
        Error::Sqlite(ref e) if dialect.is_transient_error(e) => Error::StorageUnavailable(e.to_string()),
        other => other,
    }
}

// =============================================================================
// Tests
// =============================================================================
