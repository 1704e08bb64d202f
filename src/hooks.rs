//! # Pipeline Hooks
//!
//! Hooks observe and shape the traffic between callers and a commit store:
//!
//! ```text
//! commit(attempt) ──► pre_commit (may veto) ──► store ──► post_commit
//! reads           ◄── select (may rewrite or drop) ◄── store
//! purge / delete  ──► store ──► on_purge / on_delete_stream
//! ```
//!
//! [`HookedCommitStore`] applies a hook list around any inner store and is
//! itself a [`CommitStore`], so streams and pollers use it unchanged.
//!
//! A hook that drops commits from `select` also drops them from the
//! checkpoint feed. A poller reading through it sees the dropped checkpoints
//! as holes and waits out its hole policy once per gap.

use std::sync::Arc;

use crate::error::Result;
use crate::store::{CommitStore, Commits};
use crate::types::{BucketId, Checkpoint, Commit, CommitAttempt, Snapshot, StreamHead, StreamId};

/// Interception points around a commit store. Every method has a no-op
/// default.
pub trait PipelineHook: Send + Sync {
    /// Called for each commit read from the store. Return `None` to hide it.
    fn select(&self, commit: Commit) -> Option<Commit> {
        Some(commit)
    }

    /// Called before an attempt reaches the store. An error vetoes the
    /// commit and is returned to the caller.
    fn pre_commit(&self, _attempt: &CommitAttempt) -> Result<()> {
        Ok(())
    }

    /// Called after a commit is persisted.
    fn post_commit(&self, _commit: &Commit) {}

    /// Called after a purge. `None` means the whole store.
    fn on_purge(&self, _bucket_id: Option<&BucketId>) {}

    /// Called after a stream is deleted.
    fn on_delete_stream(&self, _bucket_id: &BucketId, _stream_id: &StreamId) {}
}

/// A [`CommitStore`] decorator that runs [`PipelineHook`]s.
///
/// Hooks run in registration order.
pub struct HookedCommitStore {
    inner: Arc<dyn CommitStore>,
    hooks: Arc<[Arc<dyn PipelineHook>]>,
}

impl HookedCommitStore {
    /// Wraps `inner` with `hooks`.
    pub fn new(inner: Arc<dyn CommitStore>, hooks: Vec<Arc<dyn PipelineHook>>) -> Self {
        Self {
            inner,
            hooks: hooks.into(),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<dyn CommitStore> {
        &self.inner
    }

    fn select(&self, commit: Commit) -> Option<Commit> {
        self.hooks.iter().try_fold(commit, |commit, hook| hook.select(commit))
    }

    fn select_all<'a>(&'a self, commits: Commits<'a>) -> Commits<'a> {
        Box::new(commits.filter_map(move |item| match item {
            Ok(commit) => self.select(commit).map(Ok),
            Err(e) => Some(Err(e)),
        }))
    }
}

impl CommitStore for HookedCommitStore {
    fn initialize(&self) -> Result<()> {
        self.inner.initialize()
    }

    fn commit(&self, attempt: CommitAttempt) -> Result<Commit> {
        for hook in self.hooks.iter() {
            hook.pre_commit(&attempt)?;
        }
        let commit = self.inner.commit(attempt)?;
        for hook in self.hooks.iter() {
            hook.post_commit(&commit);
        }
        Ok(commit)
    }

    fn get_from(
        &self,
        bucket_id: &BucketId,
        stream_id: &StreamId,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Vec<Commit>> {
        let commits = self.inner.get_from(bucket_id, stream_id, min_revision, max_revision)?;
        Ok(commits.into_iter().filter_map(|commit| self.select(commit)).collect())
    }

    fn get_from_checkpoint(&self, checkpoint: Checkpoint) -> Result<Commits<'_>> {
        Ok(self.select_all(self.inner.get_from_checkpoint(checkpoint)?))
    }

    fn get_from_bucket_checkpoint(&self, bucket_id: &BucketId, checkpoint: Checkpoint) -> Result<Commits<'_>> {
        Ok(self.select_all(self.inner.get_from_bucket_checkpoint(bucket_id, checkpoint)?))
    }

    fn get_undispatched_commits(&self) -> Result<Commits<'_>> {
        Ok(self.select_all(self.inner.get_undispatched_commits()?))
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
        self.inner.delete_stream(bucket_id, stream_id)?;
        for hook in self.hooks.iter() {
            hook.on_delete_stream(bucket_id, stream_id);
        }
        Ok(())
    }

    fn purge_bucket(&self, bucket_id: &BucketId) -> Result<()> {
        self.inner.purge_bucket(bucket_id)?;
        for hook in self.hooks.iter() {
            hook.on_purge(Some(bucket_id));
        }
        Ok(())
    }

    fn purge(&self) -> Result<()> {
        self.inner.purge()?;
        for hook in self.hooks.iter() {
            hook.on_purge(None);
        }
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        self.inner.dispose()
    }

    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

// =============================================================================
// Tests
// =============================================================================
