//! Reactor, event registration and timer wake-up tests

mod common;

use std::net::TcpListener;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use weft::{Event, Fiber, IoManager};

const WAIT: Duration = Duration::from_secs(3);

/// Fill `fd`'s send buffer until the kernel refuses more.
fn fill(fd: RawFd) {
    let chunk = [0u8; 4096];
    loop {
        let n = unsafe { libc::write(fd, chunk.as_ptr().cast(), chunk.len()) };
        if n < 0 {
            assert_eq!(weft::util::errno(), libc::EAGAIN);
            return;
        }
    }
}

/// Read everything currently queued on `fd`.
fn drain(fd: RawFd) {
    let mut buf = [0u8; 4096];
    while unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
}

#[test]
fn test_callback_event_fires_once() {
    common::init_test_logging();
    let iom = IoManager::new(2, false, "cb_event").unwrap();
    let (a, b) = common::socketpair();
    common::set_nonblocking(a);

    let (tx, rx) = crossbeam::channel::unbounded();
    iom.add_event(a, Event::READ, Some(Box::new(move || tx.send(()).unwrap())))
        .unwrap();
    assert_eq!(iom.pending_event_count(), 1);

    common::write_all(b, b"ping");
    rx.recv_timeout(WAIT).unwrap();
    // One-shot: a second write does not run the callback again.
    common::write_all(b, b"ping");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(iom.pending_event_count(), 0);
    assert!(iom.armed_events(a).is_empty());

    iom.stop();
    common::close(a);
    common::close(b);
}

#[test]
fn test_partial_fire_rearms_remaining_direction() {
    common::init_test_logging();
    let iom = IoManager::new(1, false, "rearm").unwrap();
    let (a, b) = common::socketpair();
    common::set_nonblocking(a);
    common::set_nonblocking(b);
    fill(a);

    let (tx, rx) = crossbeam::channel::unbounded();
    let read_tx = tx.clone();
    iom.add_event(a, Event::READ, Some(Box::new(move || read_tx.send("read").unwrap())))
        .unwrap();
    iom.add_event(a, Event::WRITE, Some(Box::new(move || tx.send("write").unwrap())))
        .unwrap();
    assert_eq!(iom.armed_events(a), Event::READ | Event::WRITE);
    assert_eq!(iom.pending_event_count(), 2);

    common::write_all(b, b"x");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "read");
    assert_eq!(iom.armed_events(a), Event::WRITE);
    assert_eq!(iom.pending_event_count(), 1);

    // The untouched direction still gets its edge.
    drain(b);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "write");
    assert!(iom.armed_events(a).is_empty());
    assert_eq!(iom.pending_event_count(), 0);

    iom.stop();
    common::close(a);
    common::close(b);
}

#[test]
fn test_fiber_resumes_when_connect_completes() {
    common::init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let iom = IoManager::new(1, false, "connect_wait").unwrap();

    let (tx, rx) = crossbeam::channel::bounded(1);
    let waiter = iom.clone();
    iom.schedule_fn(
        move || unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
            assert!(fd >= 0);
            let addr = common::loopback(port);
            let rc = libc::connect(
                fd,
                (&addr as *const libc::sockaddr_in).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
            if rc != 0 {
                assert_eq!(weft::util::errno(), libc::EINPROGRESS);
                waiter.add_event(fd, Event::WRITE, None).unwrap();
                Fiber::yield_to_hold();
            }
            // READ was never armed on this fd.
            let cancelled = waiter.cancel_event(fd, Event::READ);
            tx.send((fd, cancelled)).unwrap();
        },
        None,
    );

    let (fd, cancelled) = rx.recv_timeout(WAIT).unwrap();
    assert!(!cancelled);
    iom.stop();
    common::close(fd);
}

#[test]
fn test_cancel_event_wakes_waiting_fiber() {
    common::init_test_logging();
    let iom = IoManager::new(1, false, "cancel_wake").unwrap();
    let (a, b) = common::socketpair();
    common::set_nonblocking(a);

    let (armed_tx, armed_rx) = crossbeam::channel::bounded(1);
    let (done_tx, done_rx) = crossbeam::channel::bounded(1);
    let waiter = iom.clone();
    iom.schedule_fn(
        move || {
            waiter.add_event(a, Event::READ, None).unwrap();
            armed_tx.send(()).unwrap();
            Fiber::yield_to_hold();
            done_tx.send(()).unwrap();
        },
        None,
    );

    armed_rx.recv_timeout(WAIT).unwrap();
    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(iom.cancel_event(a, Event::READ));
    done_rx.recv_timeout(WAIT).unwrap();
    assert!(!iom.cancel_event(a, Event::READ));

    iom.stop();
    common::close(a);
    common::close(b);
}

#[test]
fn test_cancel_all_fires_both_directions() {
    common::init_test_logging();
    let iom = IoManager::new(1, false, "cancel_all").unwrap();
    let (a, b) = common::socketpair();
    common::set_nonblocking(a);
    fill(a);

    let hits = Arc::new(AtomicUsize::new(0));
    for event in [Event::READ, Event::WRITE] {
        let h = hits.clone();
        iom.add_event(a, event, Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
    }
    assert!(iom.cancel_all(a));
    assert!(!iom.cancel_all(a));
    iom.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(iom.pending_event_count(), 0);
    common::close(a);
    common::close(b);
}

#[test]
fn test_condition_timer_with_dropped_guard_never_fires() {
    common::init_test_logging();
    let iom = IoManager::new(1, false, "cond_timer").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let guard = Arc::new(());
    let h = hits.clone();
    iom.add_condition_timer(
        100,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&guard),
        false,
    );
    std::thread::sleep(Duration::from_millis(50));
    drop(guard);
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(!iom.timers().has_timer());
    iom.stop();
}

#[test]
fn test_front_timer_interrupts_long_wait() {
    common::init_test_logging();
    let iom = IoManager::new(1, false, "front_timer").unwrap();
    // Let the worker settle into epoll_wait with the full max wait.
    std::thread::sleep(Duration::from_millis(50));

    let (tx, rx) = crossbeam::channel::bounded(1);
    let start = Instant::now();
    iom.add_timer(20, move || { let _ = tx.try_send(()); }, false);
    rx.recv_timeout(WAIT).unwrap();
    assert!(start.elapsed() < Duration::from_millis(1000));
    iom.stop();
}

#[test]
fn test_recurring_timer_until_cancelled() {
    common::init_test_logging();
    let iom = IoManager::new(2, false, "recurring").unwrap();
    let (tx, rx) = crossbeam::channel::unbounded();
    let handle = iom.add_timer(10, move || { let _ = tx.send(()); }, true);
    for _ in 0..3 {
        rx.recv_timeout(WAIT).unwrap();
    }
    assert!(handle.cancel());
    iom.stop();
    assert!(!iom.timers().has_timer());
}

#[test]
fn test_stop_waits_for_pending_timer() {
    common::init_test_logging();
    let iom = IoManager::new(1, true, "stop_timer").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    iom.add_timer(
        50,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );
    let start = Instant::now();
    iom.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test]
fn test_current_is_none_outside_workers() {
    let iom = IoManager::new(1, false, "outside").unwrap();
    assert!(IoManager::current().is_none());
    iom.stop();
}
