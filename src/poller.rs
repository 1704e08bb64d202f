//! # Checkpoint Catch-Up Poller
//!
//! A background consumer that reads the commit feed from a checkpoint,
//! passes every commit through a [`Sequencer`], and hands the ones that are
//! safe to deliver to a [`CommitHandler`].
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  poll_now / stop   ┌────────────────────────────────────┐
//! │ CommitPoller  │ ─────────────────► │ poller thread (current-thread      │
//! │ (handle)      │   control queue    │ tokio runtime)                     │
//! │               │                    │                                    │
//! │ last_activity │ ◄── shared status ─│  loop {                            │
//! │ last_error    │                    │    select! { control, sleep(d) }   │
//! │ checkpoint    │                    │    poll_once():                    │
//! └───────┬───────┘                    │      store.get_from_checkpoint()   │
//!         │ dispose()                  │      sequencer → gate → handler    │
//!         └── wait for exit ─────────► │  }                                 │
//!             then close gate          └────────────────────────────────────┘
//! ```
//!
//! ## Poll Outcomes
//!
//! | Outcome | Next wait |
//! |---------|-----------|
//! | batch drained | `poll_interval` (or until `poll_now`) |
//! | `Retry` (handler or hole) | `retry_backoff`, same checkpoint |
//! | fetch failed | `error_backoff` |
//! | `Stop` (handler or `stop()`) | worker exits before the next commit |
//!
//! ## The Delivery Gate
//!
//! Every delivery first takes the gate lock and checks that the poller has
//! not been disposed. `dispose` closes the gate even when the worker did not
//! exit in time, so once it returns no new callback starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc;
use tracing::Span;

use crate::error::{Error, Result};
use crate::sequencer::{CommitHandler, HandlingResult, HolePolicy, Sequencer};
use crate::store::CommitStore;
use crate::sync::lock;
use crate::types::Checkpoint;

// =============================================================================
// Configuration
// =============================================================================

/// Default wait between polls once the feed is drained.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default wait before re-querying after a `Retry`.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Default wait before re-querying after a fetch error.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Default minimum time between two logged fetch errors.
pub const DEFAULT_ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on how long `dispose` waits for the worker.
pub const DEFAULT_DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the control queue. A wake-up sent to a full queue is dropped:
/// one is already pending.
const CONTROL_CHANNEL_BOUND: usize = 4;

/// Configuration for [`CommitPoller`].
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Name used for the worker thread and in logs.
    pub name: String,

    /// Wait between polls once the feed has been drained.
    pub poll_interval: Duration,

    /// When to give up on a checkpoint hole.
    pub hole_policy: HolePolicy,

    /// Wait before re-querying after `HandlingResult::Retry`.
    pub retry_backoff: Duration,

    /// Wait before re-querying after a failed fetch.
    pub error_backoff: Duration,

    /// Fetch errors are logged at most once per this interval.
    pub error_log_interval: Duration,

    /// How long `dispose` waits for the worker to exit.
    pub dispose_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            name: "commit-poller".to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            hole_policy: HolePolicy::default(),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            error_log_interval: DEFAULT_ERROR_LOG_INTERVAL,
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
        }
    }
}

impl PollerConfig {
    /// Sets the poller name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the hole policy.
    pub fn with_hole_policy(mut self, policy: HolePolicy) -> Self {
        self.hole_policy = policy;
        self
    }

    /// Sets the retry backoff.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the error backoff.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Sets the error log interval.
    pub fn with_error_log_interval(mut self, interval: Duration) -> Self {
        self.error_log_interval = interval;
        self
    }

    /// Sets the dispose wait bound.
    pub fn with_dispose_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_timeout = timeout;
        self
    }
}

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug)]
enum Control {
    Wake,
    Stop,
}

#[derive(Debug, Default)]
struct PollerStatus {
    last_activity: Option<SystemTime>,
    last_error: Option<Arc<Error>>,
    checkpoint: Checkpoint,
    running: bool,
}

/// State shared between the handle and the worker.
#[derive(Debug, Default)]
struct Shared {
    status: Mutex<PollerStatus>,
    in_flight: AtomicBool,
    stop_requested: AtomicBool,
    /// Held for the duration of every callback.
    gate: Mutex<()>,
    closed: AtomicBool,
}

impl Shared {
    fn touch(&self) {
        lock(&self.status).last_activity = Some(SystemTime::now());
    }
}

/// Rate limit for fetch-error logging.
#[derive(Debug)]
struct ErrorThrottle {
    interval: Duration,
    last_logged: Option<Instant>,
    suppressed: u64,
}

impl ErrorThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: None,
            suppressed: 0,
        }
    }

    /// Returns the number of errors suppressed since the last logged one,
    /// or `None` if this error should not be logged.
    fn admit(&mut self, now: Instant) -> Option<u64> {
        let due = self
            .last_logged
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            self.suppressed += 1;
            return None;
        }
        self.last_logged = Some(now);
        Some(std::mem::take(&mut self.suppressed))
    }
}

// =============================================================================
// Worker
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    Drained,
    Retry,
    Failed,
    Stopped,
}

struct PollWorker {
    store: Arc<dyn CommitStore>,
    sequencer: Sequencer,
    handler: Box<dyn CommitHandler>,
    shared: Arc<Shared>,
    throttle: ErrorThrottle,
}

impl PollWorker {
    /// One fetch-and-deliver pass. Single-flight by construction: only the
    /// worker thread calls it.
    fn poll_once(&mut self) -> PollOutcome {
        self.shared.in_flight.store(true, Ordering::SeqCst);
        let outcome = self.drain();
        self.shared.in_flight.store(false, Ordering::SeqCst);
        outcome
    }

    fn drain(&mut self) -> PollOutcome {
        self.shared.touch();

        let store = Arc::clone(&self.store);
        let from = self.sequencer.last_read();
        let commits = match store.get_from_checkpoint(from) {
            Ok(commits) => commits,
            Err(e) => return self.failed(e),
        };

        let mut fetched = false;
        let mut delivered = 0usize;
        for item in commits {
            let commit = match item {
                Ok(commit) => commit,
                Err(e) => return self.failed(e),
            };
            if !fetched {
                fetched = true;
                lock(&self.shared.status).last_error = None;
            }
            // The pager keeps yielding while writers append; stop between commits.
            if self.shared.stop_requested.load(Ordering::SeqCst) {
                tracing::debug!(checkpoint = self.sequencer.last_read().as_raw(), delivered, "stop requested mid-batch");
                return PollOutcome::Stopped;
            }

            let shared = &self.shared;
            let handler = &mut self.handler;
            let result = self.sequencer.handle(&commit, |commit| {
                let _gate = lock(&shared.gate);
                if shared.closed.load(Ordering::SeqCst) {
                    return HandlingResult::Stop;
                }
                shared.touch();
                handler.handle(commit)
            });

            match result {
                HandlingResult::MoveToNext => {
                    delivered += 1;
                    lock(&self.shared.status).checkpoint = self.sequencer.last_read();
                }
                HandlingResult::Retry => {
                    tracing::debug!(checkpoint = from.as_raw(), delivered, "retrying from checkpoint");
                    return PollOutcome::Retry;
                }
                HandlingResult::Stop => {
                    tracing::info!(checkpoint = self.sequencer.last_read().as_raw(), "handler stopped polling");
                    return PollOutcome::Stopped;
                }
            }
        }

        if !fetched {
            lock(&self.shared.status).last_error = None;
        }
        if delivered > 0 {
            tracing::debug!(
                delivered,
                checkpoint = self.sequencer.last_read().as_raw(),
                "poll drained"
            );
        }
        PollOutcome::Drained
    }

    fn failed(&mut self, error: Error) -> PollOutcome {
        if let Some(suppressed) = self.throttle.admit(Instant::now()) {
            if error.is_transient() {
                tracing::warn!(error = %error, suppressed, "commit feed unavailable");
            } else {
                tracing::error!(error = %error, suppressed, "failed to read commit feed");
            }
        }
        lock(&self.shared.status).last_error = Some(Arc::new(error));
        PollOutcome::Failed
    }
}

/// The poller thread's main loop.
async fn run_poller(mut worker: PollWorker, mut control_rx: mpsc::Receiver<Control>, config: PollerConfig) {
    tracing::info!(checkpoint = worker.sequencer.last_read().as_raw(), "poller started");

    // The first poll runs immediately.
    let mut delay = Duration::ZERO;
    loop {
        tokio::select! {
            control = control_rx.recv() => match control {
                Some(Control::Wake) => {}
                Some(Control::Stop) | None => break,
            },
            _ = tokio::time::sleep(delay) => {}
        }
        if worker.shared.stop_requested.load(Ordering::SeqCst) {
            break;
        }

        delay = match worker.poll_once() {
            PollOutcome::Drained => config.poll_interval,
            PollOutcome::Retry => config.retry_backoff,
            PollOutcome::Failed => config.error_backoff,
            PollOutcome::Stopped => break,
        };
    }

    lock(&worker.shared.status).running = false;
    tracing::info!(checkpoint = worker.sequencer.last_read().as_raw(), "poller stopped");
}

// =============================================================================
// Handle
// =============================================================================

/// Handle to a running poller.
///
/// Dropping the handle disposes the poller.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use spitelog::{CommitPoller, HandlingResult, InMemoryCommitStore, PollerConfig};
/// use spitelog::types::Checkpoint;
///
/// let store = Arc::new(InMemoryCommitStore::new());
/// let poller = CommitPoller::start(store, Checkpoint::START, PollerConfig::default(), |commit: &spitelog::Commit| {
///     println!("checkpoint {}", commit.checkpoint);
///     HandlingResult::MoveToNext
/// })?;
/// poller.dispose()?;
/// # Ok::<(), spitelog::Error>(())
/// ```
#[derive(Debug)]
pub struct CommitPoller {
    name: String,
    shared: Arc<Shared>,
    control_tx: mpsc::Sender<Control>,
    /// Disconnects when the worker thread exits.
    exit_rx: Mutex<Option<std_mpsc::Receiver<()>>>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    dispose_timeout: Duration,
    disposed: AtomicBool,
}

impl CommitPoller {
    /// Starts polling `store` for commits after `from`.
    ///
    /// # Errors
    ///
    /// `Error::Storage` if the worker thread cannot be spawned.
    pub fn start(
        store: Arc<dyn CommitStore>,
        from: Checkpoint,
        config: PollerConfig,
        handler: impl CommitHandler,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        {
            let mut status = lock(&shared.status);
            status.checkpoint = from;
            status.running = true;
        }

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_BOUND);
        let (exit_tx, exit_rx) = std_mpsc::channel::<()>();

        let worker = PollWorker {
            store,
            sequencer: Sequencer::new(from, config.hole_policy),
            handler: Box::new(handler),
            shared: Arc::clone(&shared),
            throttle: ErrorThrottle::new(config.error_log_interval),
        };

        let span = tracing::info_span!("poller", name = %config.name);
        let name = config.name.clone();
        let dispose_timeout = config.dispose_timeout;
        let thread_shared = Arc::clone(&shared);

        let thread_handle = thread::Builder::new()
            .name(format!("spitelog-poller-{name}"))
            .spawn(move || {
                // Dropped on return, which disconnects `exit_rx`.
                let _exit_tx = exit_tx;
                let _entered = span.enter();

                let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to create poller runtime");
                        lock(&thread_shared.status).running = false;
                        return;
                    }
                };
                rt.block_on(run_poller(worker, control_rx, config));
            })
            .map_err(|e| Error::Storage(format!("failed to spawn poller thread: {e}")))?;

        Ok(Self {
            name,
            shared,
            control_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
            thread_handle: Mutex::new(Some(thread_handle)),
            dispose_timeout,
            disposed: AtomicBool::new(false),
        })
    }

    /// The configured name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Requests an immediate poll. A no-op while a poll is in flight.
    pub fn poll_now(&self) {
        if self.shared.in_flight.load(Ordering::SeqCst) {
            return;
        }
        // Full queue: a wake-up is already pending.
        let _ = self.control_tx.try_send(Control::Wake);
    }

    /// Asks the worker to exit once the callback in flight returns. Commits
    /// not yet handed to the handler are left for the next poller.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.control_tx.try_send(Control::Stop);
    }

    /// Time of the last poll start or delivery attempt.
    pub fn last_activity(&self) -> Option<SystemTime> {
        lock(&self.shared.status).last_activity
    }

    /// The error of the last failed fetch, cleared by the next successful one.
    pub fn last_polling_error(&self) -> Option<Arc<Error>> {
        lock(&self.shared.status).last_error.clone()
    }

    /// The last checkpoint delivered (or skipped past).
    pub fn checkpoint(&self) -> Checkpoint {
        lock(&self.shared.status).checkpoint
    }

    /// True until the worker loop has returned.
    pub fn is_running(&self) -> bool {
        lock(&self.shared.status).running
    }

    /// Stops the poller and waits up to the dispose timeout for the worker
    /// to exit. No callback starts after this returns.
    ///
    /// # Errors
    ///
    /// [`Error::PollerTimeout`] if the worker was still running (usually
    /// inside a callback) when the wait ended. The gate is closed anyway.
    pub fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop();

        let deadline = Instant::now() + self.dispose_timeout;
        let exited = match lock(&self.exit_rx).take() {
            Some(exit_rx) => matches!(
                exit_rx.recv_timeout(self.dispose_timeout),
                Err(std_mpsc::RecvTimeoutError::Disconnected) | Ok(())
            ),
            None => true,
        };

        if exited {
            if let Some(handle) = lock(&self.thread_handle).take() {
                if handle.join().is_err() {
                    tracing::error!(poller = %self.name, "poller thread panicked");
                }
            }
        }

        let gate_closed = self.close_gate(deadline);
        if exited {
            tracing::debug!(poller = %self.name, "poller disposed");
            return Ok(());
        }

        tracing::warn!(
            poller = %self.name,
            timeout_ms = self.dispose_timeout.as_millis() as u64,
            callback_running = !gate_closed,
            "poller did not stop in time"
        );
        Err(Error::PollerTimeout {
            name: self.name.clone(),
            timeout_ms: self.dispose_timeout.as_millis() as u64,
        })
    }

    /// Marks the gate closed, then waits (until `deadline`) for a callback
    /// that passed the check before it was closed. Returns false if one is
    /// still running.
    fn close_gate(&self, deadline: Instant) -> bool {
        self.shared.closed.store(true, Ordering::SeqCst);
        loop {
            match self.shared.gate.try_lock() {
                Ok(_) | Err(TryLockError::Poisoned(_)) => return true,
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(TryLockError::WouldBlock) => return false,
            }
        }
    }
}

impl Drop for CommitPoller {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}

// =============================================================================
// Tests
// =============================================================================
