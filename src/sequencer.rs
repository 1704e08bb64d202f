//! # Checkpoint Sequencer
//!
//! Turns the raw checkpoint feed, which may show holes, into a delivery
//! order with no gaps, as far as the hole policy allows.
//!
//! ## Why Holes Happen
//!
//! ```text
//! writer A: draws checkpoint 5 ──────────────── insert visible ──►
//! writer B: draws checkpoint 6 ── insert visible ──►
//! poller:                           scan: [.., 4, 6]      scan: [.., 4, 5, 6]
//!                                         ▲ hole at 5
//! ```
//!
//! A poller that delivered 6 right away would skip 5 forever, because its
//! cursor only moves forward. The sequencer holds back 6 and asks the
//! poller to re-query until 5 appears, or until the hole has been waited
//! on long enough that it is assumed permanent (a rolled-back insert, a
//! purged commit, a hook that hides it).
//!
//! ## Decisions per Commit
//!
//! | Checkpoint | Action |
//! |------------|--------|
//! | `<= last_read` | skip, report `MoveToNext` |
//! | `== last_read + 1` | deliver |
//! | `> last_read + 1`, hole under threshold | report `Retry` |
//! | `> last_read + 1`, hole over threshold | deliver, reset hole |

use std::time::{Duration, Instant};

use crate::types::{Checkpoint, Commit};

/// Default time a hole is waited on before delivery skips past it.
pub const DEFAULT_HOLE_TIMEOUT: Duration = Duration::from_secs(2);

/// What the consumer (or the sequencer on its behalf) wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlingResult {
    /// The commit is handled; advance to the next one.
    MoveToNext,
    /// Abandon the batch and re-query from the same checkpoint after the
    /// retry backoff.
    Retry,
    /// Stop polling for good.
    Stop,
}

/// How long a poller waits on a hole before delivering past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolePolicy {
    /// Wait at least this long since the hole was first seen.
    Elapsed(Duration),
    /// Re-query this many times, then deliver.
    RetryCount(u32),
    /// Never wait: deliver in the order the store returns.
    Disabled,
}

impl Default for HolePolicy {
    fn default() -> Self {
        HolePolicy::Elapsed(DEFAULT_HOLE_TIMEOUT)
    }
}

/// The consumer callback of a [`CommitPoller`](crate::CommitPoller).
///
/// Runs synchronously on the poller thread, one commit at a time, with no
/// imposed timeout.
///
/// # Rust Pattern: Blanket Impl for Closures
///
/// Any `FnMut(&Commit) -> HandlingResult` closure is a handler, so callers
/// rarely implement this trait by hand.
pub trait CommitHandler: Send + 'static {
    /// Handles one commit.
    fn handle(&mut self, commit: &Commit) -> HandlingResult;
}

impl<F> CommitHandler for F
where
    F: FnMut(&Commit) -> HandlingResult + Send + 'static,
{
    fn handle(&mut self, commit: &Commit) -> HandlingResult {
        self(commit)
    }
}

/// The hole currently being waited on.
#[derive(Debug, Clone, Copy)]
struct Hole {
    /// The checkpoint that is missing.
    expected: Checkpoint,
    first_seen: Instant,
    retries: u32,
}

/// Gap-tolerant ordering state of one poller.
#[derive(Debug)]
pub struct Sequencer {
    last_read: Checkpoint,
    policy: HolePolicy,
    hole: Option<Hole>,
}

impl Sequencer {
    /// Creates a sequencer that has already delivered everything up to
    /// and including `last_read`.
    pub fn new(last_read: Checkpoint, policy: HolePolicy) -> Self {
        Self {
            last_read,
            policy,
            hole: None,
        }
    }

    /// The last checkpoint delivered (or skipped past).
    pub fn last_read(&self) -> Checkpoint {
        self.last_read
    }

    /// True while waiting on a hole.
    pub fn is_waiting(&self) -> bool {
        self.hole.is_some()
    }

    /// Offers `commit`, calling `deliver` only when it is safe to.
    pub fn handle(&mut self, commit: &Commit, deliver: impl FnOnce(&Commit) -> HandlingResult) -> HandlingResult {
        self.handle_at(commit, Instant::now(), deliver)
    }

    /// Like [`Sequencer::handle`] with an explicit clock reading.
    pub fn handle_at(
        &mut self,
        commit: &Commit,
        now: Instant,
        deliver: impl FnOnce(&Commit) -> HandlingResult,
    ) -> HandlingResult {
        let checkpoint = commit.checkpoint;
        if checkpoint <= self.last_read {
            return HandlingResult::MoveToNext;
        }

        let expected = self.last_read.next();
        if checkpoint == expected || self.policy == HolePolicy::Disabled {
            return self.deliver(commit, deliver);
        }

        if self.hole.is_some_and(|hole| hole.expected != expected) {
            self.hole = None;
        }
        let hole = self.hole.get_or_insert(Hole {
            expected,
            first_seen: now,
            retries: 0,
        });

        let waited = now.saturating_duration_since(hole.first_seen);
        let exceeded = match self.policy {
            HolePolicy::Elapsed(limit) => waited >= limit,
            HolePolicy::RetryCount(limit) => hole.retries >= limit,
            HolePolicy::Disabled => true,
        };

        if !exceeded {
            hole.retries += 1;
            tracing::debug!(
                expected = expected.as_raw(),
                checkpoint = checkpoint.as_raw(),
                retries = hole.retries,
                "waiting on checkpoint hole"
            );
            return HandlingResult::Retry;
        }

        tracing::warn!(
            expected = expected.as_raw(),
            checkpoint = checkpoint.as_raw(),
            waited_ms = waited.as_millis() as u64,
            retries = hole.retries,
            "delivering past checkpoint hole"
        );
        self.hole = None;
        self.deliver(commit, deliver)
    }

    fn deliver(&mut self, commit: &Commit, deliver: impl FnOnce(&Commit) -> HandlingResult) -> HandlingResult {
        let result = deliver(commit);
        if result == HandlingResult::MoveToNext {
            self.last_read = self.last_read.max(commit.checkpoint);
            self.hole = None;
        }
        result
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BucketId, CommitId, EventMessage, Headers, StreamId};

    fn commit_at(checkpoint: i64) -> Commit {
        Commit {
            bucket_id: BucketId::default(),
            stream_id: StreamId::new("s"),
            stream_revision: 1,
            commit_id: CommitId::generate(),
            commit_sequence: 1,
            commit_stamp_ms: 0,
            checkpoint: Checkpoint::from_raw(checkpoint),
            headers: Headers::new(),
            events: vec![EventMessage::new(b"e".to_vec())],
        }
    }

    fn accept(delivered: &mut Vec<i64>) -> impl FnOnce(&Commit) -> HandlingResult + '_ {
        move |commit| {
            delivered.push(commit.checkpoint.as_raw());
            HandlingResult::MoveToNext
        }
    }

    #[test]
    fn test_contiguous_commits_are_delivered() {
        let mut sequencer = Sequencer::new(Checkpoint::START, HolePolicy::default());
        let mut delivered = Vec::new();

        for checkpoint in 1..=3 {
            let result = sequencer.handle(&commit_at(checkpoint), accept(&mut delivered));
            assert_eq!(result, HandlingResult::MoveToNext);
        }
        assert_eq!(delivered, vec![1, 2, 3]);
        assert_eq!(sequencer.last_read().as_raw(), 3);
    }

    #[test]
    fn test_already_read_commits_are_skipped() {
        let mut sequencer = Sequencer::new(Checkpoint::from_raw(5), HolePolicy::default());
        let mut delivered = Vec::new();

        assert_eq!(sequencer.handle(&commit_at(4), accept(&mut delivered)), HandlingResult::MoveToNext);
        assert!(delivered.is_empty());
    }

    #[test]
    fn test_hole_held_until_filled() {
        let mut sequencer = Sequencer::new(Checkpoint::from_raw(4), HolePolicy::Elapsed(Duration::from_secs(60)));
        let mut delivered = Vec::new();
        let start = Instant::now();

        assert_eq!(sequencer.handle_at(&commit_at(6), start, accept(&mut delivered)), HandlingResult::Retry);
        assert!(sequencer.is_waiting());

        // Re-query: 5 has appeared.
        let later = start + Duration::from_millis(100);
        sequencer.handle_at(&commit_at(5), later, accept(&mut delivered));
        sequencer.handle_at(&commit_at(6), later, accept(&mut delivered));
        assert_eq!(delivered, vec![5, 6]);
        assert!(!sequencer.is_waiting());
    }

    #[test]
    fn test_elapsed_hole_is_skipped() {
        let mut sequencer = Sequencer::new(Checkpoint::from_raw(4), HolePolicy::Elapsed(Duration::from_millis(200)));
        let mut delivered = Vec::new();
        let start = Instant::now();

        assert_eq!(sequencer.handle_at(&commit_at(6), start, accept(&mut delivered)), HandlingResult::Retry);
        assert_eq!(
            sequencer.handle_at(&commit_at(6), start + Duration::from_millis(150), accept(&mut delivered)),
            HandlingResult::Retry
        );
        assert_eq!(
            sequencer.handle_at(&commit_at(6), start + Duration::from_millis(250), accept(&mut delivered)),
            HandlingResult::MoveToNext
        );
        assert_eq!(delivered, vec![6]);

        // 5 shows up late: never delivered.
        sequencer.handle_at(&commit_at(5), start + Duration::from_millis(300), accept(&mut delivered));
        assert_eq!(delivered, vec![6]);
    }

    #[test]
    fn test_retry_count_policy() {
        let mut sequencer = Sequencer::new(Checkpoint::START, HolePolicy::RetryCount(2));
        let mut delivered = Vec::new();

        assert_eq!(sequencer.handle(&commit_at(2), accept(&mut delivered)), HandlingResult::Retry);
        assert_eq!(sequencer.handle(&commit_at(2), accept(&mut delivered)), HandlingResult::Retry);
        assert_eq!(sequencer.handle(&commit_at(2), accept(&mut delivered)), HandlingResult::MoveToNext);
        assert_eq!(delivered, vec![2]);
    }

    #[test]
    fn test_disabled_policy_delivers_in_store_order() {
        let mut sequencer = Sequencer::new(Checkpoint::START, HolePolicy::Disabled);
        let mut delivered = Vec::new();

        sequencer.handle(&commit_at(3), accept(&mut delivered));
        sequencer.handle(&commit_at(2), accept(&mut delivered));
        assert_eq!(delivered, vec![3]);
        assert_eq!(sequencer.last_read().as_raw(), 3);
    }

    #[test]
    fn test_retry_from_handler_does_not_advance() {
        let mut sequencer = Sequencer::new(Checkpoint::START, HolePolicy::default());

        let result = sequencer.handle(&commit_at(1), |_| HandlingResult::Retry);
        assert_eq!(result, HandlingResult::Retry);
        assert_eq!(sequencer.last_read(), Checkpoint::START);
    }
}
