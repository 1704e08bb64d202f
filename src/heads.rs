//! # Background Stream-Head Maintenance
//!
//! Keeping per-stream heads current is bookkeeping for snapshot scheduling,
//! not part of the commit's correctness. The in-memory engine therefore
//! moves it off the write path: `commit` enqueues a small message and
//! returns, and a dedicated worker thread applies it to the head table.
//!
//! ```text
//!  writer threads              head worker thread
//!  ──────────────              ──────────────────
//!  commit() ──► [bounded queue] ──► apply to HeadTable
//!  commit() ──►      │  ▲
//!                    │  └── Flush(ack): reply once everything before it is applied
//!  shutdown() ── drop sender ──► loop ends ──► done signal ──► join
//! ```
//!
//! ## Backpressure
//!
//! The queue is a `sync_channel` with a fixed bound. When the worker falls
//! behind, `record` blocks the committing thread until there is room, so the
//! queue never grows without limit.
//!
//! ## Ordering
//!
//! Messages are applied in the order they were enqueued and a `Flush` is
//! acknowledged only after every earlier message. Readers that must observe
//! all finished commits (`get_streams_to_snapshot`, `add_snapshot`) flush
//! first.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::Span;

use crate::error::{Error, Result};
use crate::sync::lock;
use crate::types::{BucketId, StreamHead, StreamId, StreamKey};

/// Shared head table, written by the worker and read by the store.
pub(crate) type HeadTable = Arc<Mutex<HashMap<StreamKey, StreamHead>>>;

/// Work items for the head worker.
enum HeadRequest {
    /// A commit landed; raise the stream's head revision.
    Committed {
        bucket_id: BucketId,
        stream_id: StreamId,
        stream_revision: u64,
    },

    /// Reply on the channel once every earlier request is applied.
    Flush(mpsc::Sender<()>),
}

/// Owns the head worker thread and the sending half of its queue.
#[derive(Debug)]
pub(crate) struct HeadWorker {
    /// `None` once the queue is closed.
    request_tx: Mutex<Option<SyncSender<HeadRequest>>>,
    /// Receives (or disconnects) when the worker loop has returned.
    done_rx: Mutex<Option<Receiver<()>>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeadWorker {
    /// Spawns the worker on a dedicated thread.
    ///
    /// # Panics
    ///
    /// If the OS refuses to create the thread.
    pub(crate) fn spawn(heads: HeadTable, bound: usize, span: Span) -> Self {
        let (request_tx, request_rx) = mpsc::sync_channel(bound.max(1));
        let (done_tx, done_rx) = mpsc::channel();

        let thread_handle = thread::Builder::new()
            .name("spitelog-heads".to_string())
            .spawn(move || {
                let _entered = span.enter();
                run_head_worker(&heads, request_rx);
                let _ = done_tx.send(());
            })
            .expect("failed to spawn stream head worker thread");

        Self {
            request_tx: Mutex::new(Some(request_tx)),
            done_rx: Mutex::new(Some(done_rx)),
            thread_handle: Mutex::new(Some(thread_handle)),
        }
    }

    /// Enqueues a head update. Blocks while the queue is full.
    pub(crate) fn record(&self, bucket_id: BucketId, stream_id: StreamId, stream_revision: u64) -> Result<()> {
        self.send(HeadRequest::Committed {
            bucket_id,
            stream_id,
            stream_revision,
        })
    }

    /// Waits until every update enqueued before this call has been applied.
    pub(crate) fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(HeadRequest::Flush(ack_tx))?;
        ack_rx.recv().map_err(|_| Error::Disposed)
    }

    /// Closes the queue and waits up to `timeout` for the worker to drain it.
    ///
    /// Returns `false` if the worker was still running when the wait ended;
    /// the thread is then left detached. Calling this twice is a no-op.
    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        // Dropping the only sender ends the worker's `recv` loop once the
        // queue is empty.
        drop(lock(&self.request_tx).take());

        let Some(done_rx) = lock(&self.done_rx).take() else {
            return true;
        };

        match done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = lock(&self.thread_handle).take() {
                    if handle.join().is_err() {
                        tracing::error!("stream head worker panicked");
                    }
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "stream head worker did not stop in time");
                false
            }
        }
    }

    fn send(&self, request: HeadRequest) -> Result<()> {
        // Clone the sender so a full queue never blocks while the lock is held.
        let request_tx = lock(&self.request_tx).clone().ok_or(Error::Disposed)?;
        request_tx.send(request).map_err(|_| Error::Disposed)
    }
}

/// The head worker's main loop. Returns when every sender is gone.
fn run_head_worker(heads: &HeadTable, request_rx: Receiver<HeadRequest>) {
    tracing::debug!("stream head worker started");

    while let Ok(request) = request_rx.recv() {
        match request {
            HeadRequest::Committed {
                bucket_id,
                stream_id,
                stream_revision,
            } => {
                let mut table = lock(heads);
                let key = (bucket_id, stream_id);
                match table.get_mut(&key) {
                    Some(head) => head.head_revision = head.head_revision.max(stream_revision),
                    None => {
                        let head = StreamHead::new(key.0.clone(), key.1.clone(), stream_revision);
                        table.insert(key, head);
                    }
                }
            }
            HeadRequest::Flush(ack_tx) => {
                let _ = ack_tx.send(());
            }
        }
    }

    tracing::debug!("stream head worker stopped");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(bound: usize) -> (HeadTable, HeadWorker) {
        let heads = HeadTable::default();
        let worker = HeadWorker::spawn(Arc::clone(&heads), bound, Span::none());
        (heads, worker)
    }

    fn head_of(heads: &HeadTable, stream: &str) -> Option<StreamHead> {
        heads
            .lock()
            .unwrap()
            .get(&(BucketId::default(), StreamId::new(stream)))
            .cloned()
    }

    #[test]
    fn test_flush_applies_all_earlier_updates() {
        let (heads, worker) = worker(4);

        for revision in 1..=20 {
            worker.record(BucketId::default(), StreamId::new("s"), revision).unwrap();
        }
        worker.flush().unwrap();

        assert_eq!(head_of(&heads, "s").unwrap().head_revision, 20);
        assert!(worker.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn test_head_revision_never_decreases() {
        let (heads, worker) = worker(8);

        worker.record(BucketId::default(), StreamId::new("s"), 7).unwrap();
        worker.record(BucketId::default(), StreamId::new("s"), 3).unwrap();
        worker.flush().unwrap();

        assert_eq!(head_of(&heads, "s").unwrap().head_revision, 7);
        worker.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn test_shutdown_drains_queue_and_rejects_new_work() {
        let (heads, worker) = worker(64);

        worker.record(BucketId::default(), StreamId::new("a"), 2).unwrap();
        assert!(worker.shutdown(Duration::from_secs(5)));

        assert_eq!(head_of(&heads, "a").unwrap().head_revision, 2);
        assert!(matches!(
            worker.record(BucketId::default(), StreamId::new("a"), 3),
            Err(Error::Disposed)
        ));
        assert!(matches!(worker.flush(), Err(Error::Disposed)));

        // Second shutdown is a no-op.
        assert!(worker.shutdown(Duration::from_millis(10)));
    }
}
