mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use spitelog::types::{Checkpoint, Commit};
use spitelog::{
    CommitPoller, CommitStore, Error, EventStore, HandlingResult, HolePolicy, InMemoryCommitStore, PollerConfig,
};

use common::{commit_n, eventually, ScriptedStore};

const WAIT: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(5);

fn fast_config(name: &str) -> PollerConfig {
    PollerConfig::default()
        .with_name(name)
        .with_poll_interval(Duration::from_millis(10))
        .with_retry_backoff(Duration::from_millis(10))
        .with_error_backoff(Duration::from_millis(10))
}

/// A handler that records delivered checkpoints.
fn recorder() -> (Arc<Mutex<Vec<i64>>>, impl FnMut(&Commit) -> HandlingResult + Send + 'static) {
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delivered);
    let handler = move |commit: &Commit| {
        sink.lock().unwrap().push(commit.checkpoint.as_raw());
        HandlingResult::MoveToNext
    };
    (delivered, handler)
}

fn scripted_with_commits(count: u64) -> Arc<ScriptedStore> {
    let inner: Arc<dyn CommitStore> = Arc::new(InMemoryCommitStore::new());
    commit_n(inner.as_ref(), "default", "s", count);
    Arc::new(ScriptedStore::new(inner))
}

#[test]
fn hole_is_held_until_filled() {
    let store = scripted_with_commits(3);
    store.hide(2);

    let (delivered, handler) = recorder();
    let config = fast_config("hole-held").with_hole_policy(HolePolicy::Elapsed(Duration::from_secs(60)));
    let poller = CommitPoller::start(Arc::clone(&store) as Arc<dyn CommitStore>, Checkpoint::START, config, handler).unwrap();

    eventually(WAIT, TICK, || (*delivered.lock().unwrap() == vec![1]).then_some(()));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(*delivered.lock().unwrap(), vec![1]);
    assert_eq!(poller.checkpoint().as_raw(), 1);

    store.release(2);
    eventually(WAIT, TICK, || (delivered.lock().unwrap().len() == 3).then_some(()));
    assert_eq!(*delivered.lock().unwrap(), vec![1, 2, 3]);
    poller.dispose().unwrap();
}

#[test]
fn hole_is_skipped_after_threshold() {
    let store = scripted_with_commits(3);
    store.hide(2);

    let (delivered, handler) = recorder();
    let config = fast_config("hole-skipped").with_hole_policy(HolePolicy::Elapsed(Duration::from_millis(200)));
    let started = Instant::now();
    let poller = CommitPoller::start(Arc::clone(&store) as Arc<dyn CommitStore>, Checkpoint::START, config, handler).unwrap();

    eventually(WAIT, TICK, || (delivered.lock().unwrap().len() == 2).then_some(()));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(*delivered.lock().unwrap(), vec![1, 3]);

    // The late commit stays behind the cursor.
    store.release(2);
    store
        .commit(common::attempt("default", "s", 4, 3, 1))
        .unwrap();
    eventually(WAIT, TICK, || {
        poller.poll_now();
        (delivered.lock().unwrap().len() == 3).then_some(())
    });
    assert_eq!(*delivered.lock().unwrap(), vec![1, 3, 4]);
    poller.dispose().unwrap();
}

#[test]
fn dispose_during_callback_times_out_and_blocks_later_callbacks() {
    let store = scripted_with_commits(2);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (entered_tx, entered_rx) = mpsc::channel();

    let handler = move |_: &Commit| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = entered_tx.send(());
            thread::sleep(Duration::from_millis(500));
        }
        HandlingResult::MoveToNext
    };
    let config = fast_config("slow-handler").with_dispose_timeout(Duration::from_millis(100));
    let poller = CommitPoller::start(Arc::clone(&store) as Arc<dyn CommitStore>, Checkpoint::START, config, handler).unwrap();

    entered_rx.recv_timeout(WAIT).unwrap();
    let err = poller.dispose().unwrap_err();
    assert!(matches!(err, Error::PollerTimeout { .. }), "{err:?}");

    // The blocked callback finishes; the second commit is never delivered.
    thread::sleep(Duration::from_millis(800));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!poller.is_running());

    // A second dispose is a no-op.
    poller.dispose().unwrap();
}

#[test]
fn dispose_waits_for_the_callback_in_flight() {
    let store = scripted_with_commits(3);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (entered_tx, entered_rx) = mpsc::channel();

    let handler = move |_: &Commit| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = entered_tx.send(());
            thread::sleep(Duration::from_millis(300));
        }
        HandlingResult::MoveToNext
    };
    let config = fast_config("drain").with_dispose_timeout(Duration::from_secs(5));
    let poller = CommitPoller::start(Arc::clone(&store) as Arc<dyn CommitStore>, Checkpoint::START, config, handler).unwrap();

    entered_rx.recv_timeout(WAIT).unwrap();
    let started = Instant::now();
    poller.dispose().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(!poller.is_running());

    // The rest of the batch is left undelivered.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(poller.checkpoint().as_raw(), 1);
}

#[test]
fn stop_takes_effect_inside_a_large_backlog() {
    let inner: Arc<dyn CommitStore> = Arc::new(InMemoryCommitStore::new());
    commit_n(inner.as_ref(), "default", "backlog", 2000);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handler = move |_: &Commit| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));
        HandlingResult::MoveToNext
    };
    let poller = CommitPoller::start(Arc::clone(&inner), Checkpoint::START, fast_config("backlog"), handler).unwrap();

    eventually(WAIT, TICK, || (calls.load(Ordering::SeqCst) >= 5).then_some(()));
    poller.stop();
    let at_stop = calls.load(Ordering::SeqCst);

    eventually(WAIT, TICK, || (!poller.is_running()).then_some(()));
    let after = calls.load(Ordering::SeqCst);
    assert!(after <= at_stop + 1, "{} callbacks ran after stop", after - at_stop);
    assert_eq!(poller.checkpoint().as_raw(), after as i64);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), after);
    poller.dispose().unwrap();
}

#[test]
fn retry_count_policy_skips_hole_after_n_polls() {
    let store = scripted_with_commits(3);
    store.hide(2);

    let (delivered, handler) = recorder();
    let config = fast_config("hole-retry-count").with_hole_policy(HolePolicy::RetryCount(3));
    let poller = CommitPoller::start(Arc::clone(&store) as Arc<dyn CommitStore>, Checkpoint::START, config, handler).unwrap();

    eventually(WAIT, TICK, || (delivered.lock().unwrap().len() == 2).then_some(()));
    assert_eq!(*delivered.lock().unwrap(), vec![1, 3]);
    assert_eq!(poller.checkpoint().as_raw(), 3);
    poller.dispose().unwrap();
}

#[test]
fn disabled_policy_delivers_past_holes_immediately() {
    let store = scripted_with_commits(3);
    store.hide(2);

    let (delivered, handler) = recorder();
    let config = fast_config("hole-disabled")
        .with_hole_policy(HolePolicy::Disabled)
        .with_retry_backoff(Duration::from_secs(60));
    let poller = CommitPoller::start(Arc::clone(&store) as Arc<dyn CommitStore>, Checkpoint::START, config, handler).unwrap();

    // A single retry would stall for a minute.
    eventually(WAIT, TICK, || (delivered.lock().unwrap().len() == 2).then_some(()));
    assert_eq!(*delivered.lock().unwrap(), vec![1, 3]);

    store.release(2);
    poller.poll_now();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(*delivered.lock().unwrap(), vec![1, 3]);
    poller.dispose().unwrap();
}

#[test]
fn last_activity_advances_on_every_delivery() {
    let store = scripted_with_commits(2);
    let (entered_tx, entered_rx) = mpsc::channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let handler = move |_: &Commit| {
        let _ = entered_tx.send(());
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(200));
        }
        HandlingResult::MoveToNext
    };
    // No second poll starts while the test runs.
    let config = fast_config("activity").with_poll_interval(Duration::from_secs(3600));
    let poller = CommitPoller::start(Arc::clone(&store) as Arc<dyn CommitStore>, Checkpoint::START, config, handler).unwrap();

    entered_rx.recv_timeout(WAIT).unwrap();
    let first = poller.last_activity().unwrap();
    entered_rx.recv_timeout(WAIT).unwrap();
    let second = poller.last_activity().unwrap();

    let gap = second.duration_since(first).unwrap();
    assert!(gap >= Duration::from_millis(150), "{gap:?}");
    poller.dispose().unwrap();
}

#[test]
fn polling_error_is_recorded_then_cleared() {
    let store = scripted_with_commits(1);
    store.set_failing(true);

    let (delivered, handler) = recorder();
    let poller = CommitPoller::start(
        Arc::clone(&store) as Arc<dyn CommitStore>,
        Checkpoint::START,
        fast_config("flaky"),
        handler,
    )
    .unwrap();

    let error = eventually(WAIT, TICK, || poller.last_polling_error());
    assert!(error.is_transient(), "{error:?}");
    assert!(delivered.lock().unwrap().is_empty());

    store.set_failing(false);
    eventually(WAIT, TICK, || poller.last_polling_error().is_none().then_some(()));
    eventually(WAIT, TICK, || (*delivered.lock().unwrap() == vec![1]).then_some(()));
    assert!(poller.is_running());
    poller.dispose().unwrap();
}

#[test]
fn handler_retry_redelivers_same_commit() {
    let store = scripted_with_commits(2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let handler = move |commit: &Commit| {
        let mut seen = sink.lock().unwrap();
        seen.push(commit.checkpoint.as_raw());
        let attempts = seen.iter().filter(|&&c| c == 1).count();
        if commit.checkpoint.as_raw() == 1 && attempts < 3 {
            return HandlingResult::Retry;
        }
        HandlingResult::MoveToNext
    };
    let poller = CommitPoller::start(
        Arc::clone(&store) as Arc<dyn CommitStore>,
        Checkpoint::START,
        fast_config("retry"),
        handler,
    )
    .unwrap();

    eventually(WAIT, TICK, || (poller.checkpoint().as_raw() == 2).then_some(()));
    assert_eq!(*seen.lock().unwrap(), vec![1, 1, 1, 2]);
    poller.dispose().unwrap();
}

#[test]
fn resumes_after_given_checkpoint() {
    let store = scripted_with_commits(4);
    let (delivered, handler) = recorder();
    let poller = CommitPoller::start(
        Arc::clone(&store) as Arc<dyn CommitStore>,
        Checkpoint::from_raw(2),
        fast_config("resume"),
        handler,
    )
    .unwrap();

    eventually(WAIT, TICK, || (delivered.lock().unwrap().len() == 2).then_some(()));
    assert_eq!(*delivered.lock().unwrap(), vec![3, 4]);
    assert_eq!(poller.name(), "resume");
    poller.dispose().unwrap();
}

#[test]
fn concurrent_writers_are_delivered_exactly_once_in_order() {
    const WRITERS: u64 = 4;
    const COMMITS: u64 = 50;

    let es = EventStore::new(Arc::new(InMemoryCommitStore::new()));
    let (delivered, handler) = recorder();
    let poller = es
        .start_poller(Checkpoint::START, fast_config("exactly-once"), handler)
        .unwrap();

    let writers: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let store = Arc::clone(es.advanced());
            thread::spawn(move || commit_n(store.as_ref(), "default", &format!("writer-{writer}"), COMMITS))
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let total = (WRITERS * COMMITS) as usize;
    eventually(Duration::from_secs(10), TICK, || {
        poller.poll_now();
        (delivered.lock().unwrap().len() >= total).then_some(())
    });
    thread::sleep(Duration::from_millis(50));

    let delivered = delivered.lock().unwrap().clone();
    let expected: Vec<i64> = (1..=total as i64).collect();
    assert_eq!(delivered, expected);
    poller.dispose().unwrap();
}
