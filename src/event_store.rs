//! The `EventStore` facade: one entry point that opens streams and pollers
//! over a shared commit store.

use std::sync::Arc;

use crate::error::Result;
use crate::hooks::{HookedCommitStore, PipelineHook};
use crate::poller::{CommitPoller, PollerConfig};
use crate::sequencer::CommitHandler;
use crate::store::CommitStore;
use crate::stream::OptimisticEventStream;
use crate::types::{BucketId, Checkpoint, Snapshot, StreamId};

/// Opens streams and pollers over one [`CommitStore`].
///
/// Cheap to clone; clones share the store.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use spitelog::{EventStore, InMemoryCommitStore};
/// use spitelog::types::{BucketId, CommitId, EventMessage, StreamId};
///
/// let store = EventStore::new(Arc::new(InMemoryCommitStore::new()));
/// let mut stream = store.create_stream(BucketId::default(), StreamId::new("order-1"));
/// stream.add(EventMessage::new(b"OrderPlaced".to_vec()));
/// stream.commit_changes(CommitId::generate())?;
///
/// let reopened = store.open_stream(BucketId::default(), StreamId::new("order-1"), 0, u64::MAX)?;
/// assert_eq!(reopened.stream_revision(), 1);
/// # Ok::<(), spitelog::Error>(())
/// ```
#[derive(Clone)]
pub struct EventStore {
    store: Arc<dyn CommitStore>,
}

impl EventStore {
    /// Wraps a store.
    pub fn new(store: Arc<dyn CommitStore>) -> Self {
        Self { store }
    }

    /// Wraps a store, running `hooks` around every operation.
    pub fn with_hooks(store: Arc<dyn CommitStore>, hooks: Vec<Arc<dyn PipelineHook>>) -> Self {
        if hooks.is_empty() {
            return Self::new(store);
        }
        Self::new(Arc::new(HookedCommitStore::new(store, hooks)))
    }

    /// Starts a stream with no history.
    pub fn create_stream(&self, bucket_id: BucketId, stream_id: StreamId) -> OptimisticEventStream {
        OptimisticEventStream::new(Arc::clone(&self.store), bucket_id, stream_id)
    }

    /// Opens a stream with the events in `[min_revision, max_revision]`.
    pub fn open_stream(
        &self,
        bucket_id: BucketId,
        stream_id: StreamId,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<OptimisticEventStream> {
        OptimisticEventStream::open(Arc::clone(&self.store), bucket_id, stream_id, min_revision, max_revision)
    }

    /// Opens a stream positioned at `snapshot`.
    pub fn open_stream_from_snapshot(&self, snapshot: &Snapshot, max_revision: u64) -> Result<OptimisticEventStream> {
        OptimisticEventStream::open_from_snapshot(Arc::clone(&self.store), snapshot, max_revision)
    }

    /// Starts a poller over the commit feed after `from`.
    pub fn start_poller(&self, from: Checkpoint, config: PollerConfig, handler: impl CommitHandler) -> Result<CommitPoller> {
        CommitPoller::start(Arc::clone(&self.store), from, config, handler)
    }

    /// The underlying store, for snapshots, heads, purge and dispatch.
    pub fn advanced(&self) -> &Arc<dyn CommitStore> {
        &self.store
    }

    /// Disposes the underlying store.
    pub fn dispose(&self) -> Result<()> {
        self.store.dispose()
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("disposed", &self.store.is_disposed())
            .finish()
    }
}
