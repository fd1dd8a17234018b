//! Scheduler dispatch, affinity and shutdown tests

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft::{Fiber, FiberState, Scheduler, Task};

#[test]
fn test_single_callback_runs_once() {
    common::init_test_logging();
    let scheduler = Scheduler::new(2, false, "once");
    scheduler.start().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    scheduler.schedule_fn(
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        None,
    );
    scheduler.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.pending_count(), 0);
    assert_eq!(scheduler.active_thread_count(), 0);
}

#[test]
fn test_use_caller_stop_drains_ready_fiber() {
    common::init_test_logging();
    let scheduler = Scheduler::new(1, true, "caller_only");
    scheduler.start().unwrap();
    assert_eq!(scheduler.thread_ids(), vec![weft::util::thread_id()]);

    let steps = Arc::new(AtomicUsize::new(0));
    let s = steps.clone();
    let fiber = Fiber::new(
        move || {
            s.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
            s.fetch_add(1, Ordering::SeqCst);
        },
        0,
        false,
    );
    scheduler.schedule_fiber(fiber.clone(), None);

    // Nothing runs before stop(): the caller thread is the only worker.
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(steps.load(Ordering::SeqCst), 0);

    scheduler.stop();
    assert_eq!(steps.load(Ordering::SeqCst), 2);
    assert_eq!(fiber.state(), FiberState::Term);
    assert!(Scheduler::current().is_none());
}

#[test]
fn test_use_caller_with_spawned_threads() {
    common::init_test_logging();
    let scheduler = Scheduler::new(3, true, "caller_mixed");
    scheduler.start().unwrap();
    assert_eq!(scheduler.thread_ids().len(), 3);

    let caller = weft::util::thread_id();
    let ran_on_caller = Arc::new(AtomicBool::new(false));
    let flag = ran_on_caller.clone();
    scheduler.schedule_fn(
        move || {
            flag.store(weft::util::thread_id() == caller, Ordering::SeqCst);
        },
        Some(caller),
    );

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let h = hits.clone();
        scheduler.schedule_fn(
            move || {
                Fiber::yield_to_ready();
                h.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
    }
    scheduler.stop();

    assert!(ran_on_caller.load(Ordering::SeqCst));
    assert_eq!(hits.load(Ordering::SeqCst), 20);
}

#[test]
fn test_held_fiber_waits_for_external_schedule() {
    common::init_test_logging();
    let scheduler = Scheduler::new(2, false, "hold");
    scheduler.start().unwrap();

    let (parked_tx, parked_rx) = crossbeam::channel::bounded(1);
    let (done_tx, done_rx) = crossbeam::channel::bounded(1);
    scheduler.schedule_fn(
        move || {
            parked_tx.send(Fiber::current()).unwrap();
            Fiber::yield_to_hold();
            done_tx.send(()).unwrap();
        },
        None,
    );

    let fiber = parked_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    // Held fibers are not re-queued on their own.
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());

    scheduler.schedule(Task::Fiber(fiber), None);
    done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    scheduler.stop();
}

#[test]
fn test_pinned_work_only_on_its_thread() {
    common::init_test_logging();
    let scheduler = Scheduler::new(4, false, "pinned");
    scheduler.start().unwrap();
    let ids = scheduler.thread_ids();
    assert_eq!(ids.len(), 4);

    let (tx, rx) = crossbeam::channel::unbounded();
    for (i, &tid) in ids.iter().enumerate() {
        for _ in 0..5 {
            let tx = tx.clone();
            scheduler.schedule_fn(
                move || {
                    tx.send((i, tid, weft::util::thread_id())).unwrap();
                },
                Some(tid),
            );
        }
    }
    scheduler.stop();
    drop(tx);

    let results: Vec<_> = rx.iter().collect();
    assert_eq!(results.len(), 20);
    for (_, expected, actual) in results {
        assert_eq!(expected, actual);
    }
}

#[test]
fn test_panicking_callback_does_not_stop_worker() {
    common::init_test_logging();
    let scheduler = Scheduler::new(1, false, "panics");
    scheduler.start().unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    scheduler.schedule_fn(|| panic!("callback failed"), None);
    let h = hits.clone();
    scheduler.schedule_fn(
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        None,
    );
    scheduler.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stop_without_start() {
    let scheduler = Scheduler::new(2, false, "never_started");
    scheduler.stop();
    assert_eq!(scheduler.thread_ids().len(), 0);
}
