//! # SQLite Schema for SpiteLog
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  commits                          stream_heads                          │
//! │  ┌──────────────────────────┐     ┌──────────────────────┐              │
//! │  │ checkpoint_number (PK)   │     │ bucket_id   (PK)     │              │
//! │  │ bucket_id, stream_id ────┼────►│ stream_id   (PK)     │              │
//! │  │ commit_sequence  UNIQUE* │     │ head_revision        │              │
//! │  │ commit_id        UNIQUE* │     │ snapshot_revision    │              │
//! │  │ stream_revision, items   │     └──────────────────────┘              │
//! │  │ headers, payload BLOB    │                                           │
//! │  │ checksum, dispatched     │     snapshots                             │
//! │  └──────────────────────────┘     ┌──────────────────────┐              │
//! │   * unique per (bucket, stream)   │ bucket_id, stream_id │              │
//! │                                   │ stream_revision (PK) │              │
//! │                                   │ payload BLOB         │              │
//! │                                   └──────────────────────┘              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### One row per commit
//!
//! A commit is the unit of concurrency and of delivery, so it is also the
//! unit of storage. Its events are serialized into one `payload` blob; the
//! columns that queries filter on (bucket, stream, sequence, revision,
//! dispatch flag) stay outside the blob.
//!
//! ### `AUTOINCREMENT` for checkpoints
//!
//! Plain `INTEGER PRIMARY KEY` may reuse the largest rowid after it is
//! deleted. `AUTOINCREMENT` records the high-water mark in
//! `sqlite_sequence`, so checkpoints are never reused, even after purge.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: a database written by another version is
/// rejected with [`Error::Schema`].
pub(crate) const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `commits` table is the log itself.
///
/// # Columns
///
/// - `checkpoint_number`: Store-wide position, assigned on insert
/// - `bucket_id`, `stream_id`: Stream identity
/// - `stream_revision`: Revision reached by this commit
/// - `items`: Event count, so range queries never decode the payload
/// - `commit_id`: Idempotency key
/// - `commit_sequence`: Position within the stream (1-based)
/// - `commit_stamp_ms`: Unix timestamp in milliseconds
/// - `dispatched`: 0 until `mark_commit_as_dispatched`
/// - `headers`, `payload`: Serialized commit headers and event list
/// - `checksum`: XXH3-64 of `headers || payload`
const CREATE_COMMITS: &str = r#"
CREATE TABLE IF NOT EXISTS commits (
    checkpoint_number INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket_id         TEXT    NOT NULL,
    stream_id         TEXT    NOT NULL,
    stream_revision   INTEGER NOT NULL,
    items             INTEGER NOT NULL,
    commit_id         TEXT    NOT NULL,
    commit_sequence   INTEGER NOT NULL,
    commit_stamp_ms   INTEGER NOT NULL,
    dispatched        INTEGER NOT NULL DEFAULT 0,
    headers           BLOB    NOT NULL,
    payload           BLOB    NOT NULL,
    checksum          BLOB    NOT NULL
)
"#;

/// Conflict-detection key: one commit per sequence slot.
const CREATE_COMMITS_SEQUENCE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS commits_stream_sequence
ON commits(bucket_id, stream_id, commit_sequence)
"#;

/// Duplicate-detection key: one row per commit id within a stream.
const CREATE_COMMITS_COMMIT_ID_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS commits_stream_commit_id
ON commits(bucket_id, stream_id, commit_id)
"#;

/// Supports `get_from` revision range scans.
const CREATE_COMMITS_REVISION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS commits_stream_revision
ON commits(bucket_id, stream_id, stream_revision)
"#;

/// Partial index over the (usually short) undispatched tail.
const CREATE_COMMITS_UNDISPATCHED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS commits_undispatched
ON commits(checkpoint_number) WHERE dispatched = 0
"#;

/// Per-stream snapshot bookkeeping. Updated in the commit transaction.
const CREATE_STREAM_HEADS: &str = r#"
CREATE TABLE IF NOT EXISTS stream_heads (
    bucket_id         TEXT    NOT NULL,
    stream_id         TEXT    NOT NULL,
    head_revision     INTEGER NOT NULL,
    snapshot_revision INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (bucket_id, stream_id)
)
"#;

/// Snapshots, newest found by `ORDER BY stream_revision DESC`.
const CREATE_SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    bucket_id       TEXT    NOT NULL,
    stream_id       TEXT    NOT NULL,
    stream_revision INTEGER NOT NULL,
    payload         BLOB    NOT NULL,
    PRIMARY KEY (bucket_id, stream_id, stream_revision)
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS spitelog_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the SpiteLog schema applied.
///
/// # Ownership
///
/// `Database` owns its `Connection`. [`Database::into_connection`] hands it
/// to the store, which keeps it behind a mutex.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use spitelog::sqlite::Database;
    ///
    /// let db = Database::open("commits.db")?;
    /// # Ok::<(), spitelog::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    ///
    /// In-memory databases are lost when the connection closes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Wraps an already-open connection and applies the schema.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Consumes the wrapper, returning the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Creates tables and verifies the schema version.
    ///
    /// Every statement is `IF NOT EXISTS`, so this is safe to repeat.
    fn initialize(&mut self) -> Result<()> {
        // WAL: readers see a consistent snapshot while a writer appends.
        // Ignored (stays "memory") for in-memory databases.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;

        // Sync the WAL on commit only. A lost last transaction on OS crash
        // is retried by the client with the same commit id.
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        create_tables(&self.conn)?;
        self.verify_or_set_version()
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM spitelog_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO spitelog_metadata (key, value) VALUES ('schema_version', ?1)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this SpiteLog version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Returns a reference to the underlying SQLite connection.
    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Runs every DDL statement. Idempotent.
pub(crate) fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_METADATA)?;
    conn.execute_batch(CREATE_COMMITS)?;
    conn.execute_batch(CREATE_COMMITS_SEQUENCE_INDEX)?;
    conn.execute_batch(CREATE_COMMITS_COMMIT_ID_INDEX)?;
    conn.execute_batch(CREATE_COMMITS_REVISION_INDEX)?;
    conn.execute_batch(CREATE_COMMITS_UNDISPATCHED_INDEX)?;
    conn.execute_batch(CREATE_STREAM_HEADS)?;
    conn.execute_batch(CREATE_SNAPSHOTS)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn user_tables(conn: &Connection) -> i32 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            [],
            |row| row.get(0),
        )
        .expect("should query tables")
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");

        // metadata, commits, stream_heads, snapshots
        assert_eq!(user_tables(db.connection()), 4, "expected 4 tables");
    }

    #[test]
    fn test_indexes_created() {
        let db = Database::open_in_memory().expect("should create db");

        let indexes: Vec<String> = {
            let mut stmt = db
                .connection()
                .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND name NOT LIKE 'sqlite_%'")
                .expect("should prepare");

            stmt.query_map([], |row| row.get(0))
                .expect("should query")
                .collect::<std::result::Result<Vec<_>, _>>()
                .expect("should collect")
        };

        for expected in [
            "commits_stream_sequence",
            "commits_stream_commit_id",
            "commits_stream_revision",
            "commits_undispatched",
        ] {
            assert!(indexes.contains(&expected.to_string()), "missing index {expected}");
        }
    }

    #[test]
    fn test_schema_version_stored() {
        let db = Database::open_in_memory().expect("should create db");

        let version: String = db
            .connection()
            .query_row(
                "SELECT value FROM spitelog_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .expect("should query version");

        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_double_initialization() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let _db = Database::open(&path).expect("first open should work");
        }

        let db = Database::open(&path).expect("second open should work");
        assert_eq!(user_tables(db.connection()), 4);
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("old.db");

        {
            let db = Database::open(&path).expect("should open");
            db.connection()
                .execute("UPDATE spitelog_metadata SET value = '99' WHERE key = 'schema_version'", [])
                .expect("should update");
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }
}
