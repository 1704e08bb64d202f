//! The storage-backend capability used by [`SqliteCommitStore`](super::SqliteCommitStore).
//!
//! A dialect answers the questions whose answers differ between SQL builds:
//! how a write transaction is opened, which errors mean "unique key taken",
//! which mean "try again later", and the text of the paged feed query.

use rusqlite::{ErrorCode, TransactionBehavior};

/// Which slice of the commit feed a page query selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedScope {
    /// Every commit.
    All,
    /// Commits of one bucket. The query takes the bucket as parameter `?3`.
    Bucket,
    /// Commits whose dispatch flag is clear.
    Undispatched,
}

/// Backend-specific behavior of the SQL engine.
pub trait SqlDialect: Send + Sync + 'static {
    /// How write transactions are opened.
    fn write_transaction(&self) -> TransactionBehavior;

    /// True if `error` is a unique or primary key violation.
    fn is_duplicate_key_error(&self, error: &rusqlite::Error) -> bool;

    /// True if `error` means the database is temporarily unreachable.
    fn is_transient_error(&self, error: &rusqlite::Error) -> bool;

    /// Page of the commit feed after checkpoint `?1`, at most `?2` rows,
    /// ascending by checkpoint.
    fn feed_page_query(&self, scope: FeedScope) -> String;
}

/// The dialect of the bundled SQLite build.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

/// Columns decoded by the row mapper, in order.
pub(crate) const COMMIT_COLUMNS: &str = "checkpoint_number, bucket_id, stream_id, stream_revision, commit_id, \
     commit_sequence, commit_stamp_ms, headers, payload, checksum";

impl SqlDialect for SqliteDialect {
    fn write_transaction(&self) -> TransactionBehavior {
        // Take the write lock up front so the read-check-insert sequence in
        // `commit` cannot interleave with another connection's.
        TransactionBehavior::Immediate
    }

    fn is_duplicate_key_error(&self, error: &rusqlite::Error) -> bool {
        match error {
            rusqlite::Error::SqliteFailure(e, _) => {
                e.code == ErrorCode::ConstraintViolation
                    && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
            }
            _ => false,
        }
    }

    fn is_transient_error(&self, error: &rusqlite::Error) -> bool {
        matches!(
            error,
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen)
        )
    }

    fn feed_page_query(&self, scope: FeedScope) -> String {
        let filter = match scope {
            FeedScope::All => "",
            FeedScope::Bucket => " AND bucket_id = ?3",
            FeedScope::Undispatched => " AND dispatched = 0",
        };
        format!(
            "SELECT {COMMIT_COLUMNS} FROM commits WHERE checkpoint_number > ?1{filter} \
             ORDER BY checkpoint_number LIMIT ?2"
        )
    }
}
