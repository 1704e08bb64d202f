//! # SpiteLog - Checkpointed Commit Log
//!
//! SpiteLog is an event-sourcing commit log. It provides:
//!
//! - **Optimistic streams**: buffer events, commit them as one batch, learn
//!   about competing writers through [`Error::Concurrency`]
//! - **Idempotent commits**: a retried commit id is answered with
//!   [`Error::DuplicateCommit`], never written twice
//! - **A global checkpoint feed**: every commit gets a store-wide position
//!   that downstream consumers resume from
//! - **Hole-tolerant catch-up**: [`CommitPoller`] turns the feed into one
//!   ordered delivery stream, even while concurrent writers make it show gaps
//!
//! ## Architecture Overview
//!
//! ```text
//!  write path                                   read path
//!  ──────────                                   ─────────
//! ┌───────────────────────┐                ┌──────────────────────┐
//! │ OptimisticEventStream │                │     CommitPoller     │
//! │ add / commit_changes  │                │ (worker thread)      │
//! └───────────┬───────────┘                └──────────┬───────────┘
//!             │ commit(attempt)                       │ get_from_checkpoint
//!             ▼                                       ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  CommitStore (trait, + PipelineHooks)           │
//! ├────────────────────────────────┬────────────────────────────────┤
//! │ InMemoryCommitStore            │ SqliteCommitStore              │
//! │ per-stream locks, AtomicI64,   │ one transaction per commit,    │
//! │ background head worker         │ AUTOINCREMENT checkpoints      │
//! └────────────────────────────────┴────────────────────────────────┘
//!                                                     │
//!                                          Sequencer ─┘─► CommitHandler
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Contiguous streams**: per stream, commit sequences are 1, 2, 3, ...
//!    and the first writer to claim a sequence wins
//! 2. **Revision arithmetic**: a commit's revision is the previous revision
//!    plus its event count
//! 3. **Unique checkpoints**: strictly increasing store-wide, never reused
//! 4. **Ordered delivery**: a poller never delivers a checkpoint below one it
//!    already delivered
//!
//! ## Module Organization
//!
//! - [`types`]: identifiers, checkpoints, commits, heads, snapshots
//! - [`error`]: the crate's error enum
//! - [`store`]: the [`CommitStore`] contract
//! - [`memory`], [`sqlite`]: the two engines
//! - [`stream`]: [`OptimisticEventStream`]
//! - [`sequencer`], [`poller`]: gap-tolerant catch-up
//! - [`hooks`], [`event_store`]: pipeline hooks and the facade
//! - [`serialization`]: payload encoding and checksums

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for SpiteLog operations.
pub mod error;

/// Domain types: identifiers, positions and the records stored.
pub mod types;

/// Serializer capability, checksums and the clock helper.
pub mod serialization;

/// The storage contract shared by every engine.
pub mod store;

/// The in-memory engine.
pub mod memory;

/// The SQLite engine, its schema and its dialect capability.
pub mod sqlite;

/// Client-side optimistic stream.
pub mod stream;

/// Pipeline hooks and the hooking store decorator.
pub mod hooks;

/// The `EventStore` facade.
pub mod event_store;

/// Gap-tolerant ordering of the checkpoint feed.
pub mod sequencer;

/// Background catch-up poller.
pub mod poller;

mod heads;
mod sync;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{Error, Result};
pub use event_store::EventStore;
pub use hooks::{HookedCommitStore, PipelineHook};
pub use memory::{InMemoryCommitStore, MemoryConfig};
pub use poller::{CommitPoller, PollerConfig};
pub use sequencer::{CommitHandler, HandlingResult, HolePolicy, Sequencer};
pub use serialization::{JsonSerializer, Serializer};
pub use sqlite::{SqlDialect, SqliteCommitStore, SqliteConfig, SqliteDialect};
pub use store::{CommitStore, Commits};
pub use stream::OptimisticEventStream;

pub use types::{
    BucketId, Checkpoint, Commit, CommitAttempt, CommitId, EventMessage, Headers, Snapshot, StreamHead, StreamId,
};
