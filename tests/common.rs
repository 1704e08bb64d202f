#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use spitelog::types::{BucketId, Checkpoint, Commit, CommitAttempt, CommitId, EventMessage, Headers, Snapshot, StreamHead, StreamId};
use spitelog::{CommitStore, Commits, Error, InMemoryCommitStore, Result, SqliteCommitStore};

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// One store per engine, labelled for assertion messages.
pub fn engines() -> Vec<(&'static str, Arc<dyn CommitStore>)> {
    let sqlite = SqliteCommitStore::open_in_memory().expect("open sqlite store");
    sqlite.initialize().expect("initialize sqlite store");
    vec![
        ("memory", Arc::new(InMemoryCommitStore::new()) as Arc<dyn CommitStore>),
        ("sqlite", Arc::new(sqlite) as Arc<dyn CommitStore>),
    ]
}

/// An attempt with `events` one-byte events, extending a stream that is at
/// `previous_revision` after `sequence - 1` commits.
pub fn attempt(bucket: &str, stream: &str, sequence: u64, previous_revision: u64, events: usize) -> CommitAttempt {
    CommitAttempt {
        bucket_id: BucketId::new(bucket),
        stream_id: StreamId::new(stream),
        stream_revision: previous_revision + events as u64,
        commit_id: CommitId::generate(),
        commit_sequence: sequence,
        commit_stamp_ms: 0,
        headers: Headers::new(),
        events: (0..events).map(|i| EventMessage::new(vec![i as u8 + 1])).collect(),
    }
}

/// Commits `count` single-event commits to a fresh stream.
pub fn commit_n(store: &dyn CommitStore, bucket: &str, stream: &str, count: u64) -> Vec<Commit> {
    (1..=count)
        .map(|sequence| {
            store
                .commit(attempt(bucket, stream, sequence, sequence - 1, 1))
                .expect("commit")
        })
        .collect()
}

pub fn collect(commits: Commits<'_>) -> Vec<Commit> {
    commits.collect::<Result<Vec<_>>>().expect("read feed")
}

pub fn checkpoints(commits: &[Commit]) -> Vec<i64> {
    commits.iter().map(|c| c.checkpoint.as_raw()).collect()
}

pub fn eventually<T>(timeout: Duration, interval: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let start = Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        std::thread::sleep(interval);
    }
}

// =============================================================================
// Scripted Store
// =============================================================================

/// Wraps a store, hiding chosen checkpoints from feed reads until released
/// and failing reads (feed and stream) on demand. Models a writer whose
/// insert is not yet visible, and an unavailable backend.
pub struct ScriptedStore {
    inner: Arc<dyn CommitStore>,
    hidden: Mutex<HashSet<i64>>,
    failing: AtomicBool,
}

impl ScriptedStore {
    pub fn new(inner: Arc<dyn CommitStore>) -> Self {
        Self {
            inner,
            hidden: Mutex::new(HashSet::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn hide(&self, checkpoint: i64) {
        self.hidden.lock().unwrap().insert(checkpoint);
    }

    pub fn release(&self, checkpoint: i64) {
        self.hidden.lock().unwrap().remove(&checkpoint);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn visible<'a>(&self, commits: Commits<'a>) -> Commits<'a> {
        let hidden = self.hidden.lock().unwrap().clone();
        Box::new(commits.filter(move |item| match item {
            Ok(commit) => !hidden.contains(&commit.checkpoint.as_raw()),
            Err(_) => true,
        }))
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("scripted outage".to_string()));
        }
        Ok(())
    }
}

impl CommitStore for ScriptedStore {
    fn initialize(&self) -> Result<()> {
        self.inner.initialize()
    }

    fn commit(&self, attempt: CommitAttempt) -> Result<Commit> {
        self.inner.commit(attempt)
    }

    fn get_from(&self, bucket_id: &BucketId, stream_id: &StreamId, min_revision: u64, max_revision: u64) -> Result<Vec<Commit>> {
        self.check_failing()?;
        self.inner.get_from(bucket_id, stream_id, min_revision, max_revision)
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Commits<'_>> {
        self.check_failing()?;
        Ok(self.visible(self.inner.get_from_checkpoint(checkpoint)?))
    }

    fn get_from_bucket_checkpoint(&self, bucket_id: &BucketId, checkpoint: Checkpoint) -> Result<Commits<'_>> {
        self.check_failing()?;
        Ok(self.visible(self.inner.get_from_bucket_checkpoint(bucket_id, checkpoint)?))
    }

    fn get_undispatched_commits(&self) -> Result<Commits<'_>> {
        self.inner.get_undispatched_commits()
    }

    fn mark_commit_as_dispatched(&self, commit: &Commit) -> Result<()> {
        self.inner.mark_commit_as_dispatched(commit)
    }

    fn get_stream_head(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<Option<StreamHead>> {
        self.inner.get_stream_head(bucket_id, stream_id)
    }

    fn get_snapshot(&self, bucket_id: &BucketId, stream_id: &StreamId, max_revision: u64) -> Result<Option<Snapshot>> {
        self.inner.get_snapshot(bucket_id, stream_id, max_revision)
    }

    fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        self.inner.add_snapshot(snapshot)
    }

    fn get_streams_to_snapshot(&self, bucket_id: &BucketId, threshold: u64) -> Result<Vec<StreamHead>> {
        self.inner.get_streams_to_snapshot(bucket_id, threshold)
    }

    fn delete_stream(&self, bucket_id: &BucketId, stream_id: &StreamId) -> Result<()> {
        self.inner.delete_stream(bucket_id, stream_id)
    }

    fn purge_bucket(&self, bucket_id: &BucketId) -> Result<()> {
        self.inner.purge_bucket(bucket_id)
    }

    fn purge(&self) -> Result<()> {
        self.inner.purge()
    }

    fn dispose(&self) -> Result<()> {
        self.inner.dispose()
    }

    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}
