//! IoManager: scheduler, timers and an epoll reactor
//!
//! The reactor is the [`SchedulerDriver`] of an ordinary [`Scheduler`]: its
//! idle fiber blocks in `epoll_wait` instead of spinning, with the timeout
//! taken from the soonest timer. Readiness on a registered descriptor
//! schedules whatever was waiting on it, a fiber or a callback.
//!
//! All registrations are edge-triggered. Whenever one direction fires, the
//! remaining armed directions are re-registered, otherwise their next edge
//! would be lost.

use crate::config;
use crate::error::{Error, Result};
use crate::fiber::Fiber;
use crate::hook::sys;
use crate::local;
use crate::scheduler::{Scheduler, SchedulerDriver, Task};
use crate::timer::{TimerHandle, TimerManager, TimerObserver};
use crate::util::{self, Tid};
use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

bitflags! {
    /// I/O direction a waiter is interested in. Values match epoll's.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Event: u32 {
        /// Readable (`EPOLLIN`)
        const READ = 0x1;
        /// Writable (`EPOLLOUT`)
        const WRITE = 0x4;
    }
}

const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
const EPOLLET: u32 = libc::EPOLLET as u32;

/// Size of the per-fd table before the first registration
const INITIAL_FD_SLOTS: usize = 32;

/// Pause after a transient `epoll_wait` failure
const WAIT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Whether an `epoll_wait` errno means the epoll instance itself is unusable.
fn wait_error_is_fatal(errno: libc::c_int) -> bool {
    matches!(errno, libc::EBADF | libc::EINVAL | libc::EFAULT)
}

/// What to resume when an event fires
enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

/// One armed direction of one descriptor
#[derive(Default)]
struct EventContext {
    /// Scheduler the waiter is handed to
    scheduler: Option<Weak<Scheduler>>,
    waiter: Option<Waiter>,
}

impl EventContext {
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.waiter.is_none()
    }

    fn reset(&mut self) {
        self.scheduler = None;
        self.waiter = None;
    }
}

struct FdEventsInner {
    /// Directions currently registered with epoll
    armed: Event,
    read: EventContext,
    write: EventContext,
}

impl FdEventsInner {
    fn context_mut(&mut self, event: Event) -> &mut EventContext {
        if event == Event::READ {
            &mut self.read
        } else if event == Event::WRITE {
            &mut self.write
        } else {
            fatal!("event context requested for {:?}", event);
        }
    }

    /// Disarm `event` and hand its waiter to the scheduler.
    fn trigger(&mut self, fd: RawFd, event: Event) {
        weft_assert!(
            self.armed.contains(event),
            "fd {} triggered {:?} while armed {:?}",
            fd,
            event,
            self.armed
        );
        self.armed.remove(event);
        let ctx = std::mem::take(self.context_mut(event));
        let Some(waiter) = ctx.waiter else {
            return;
        };
        match ctx.scheduler.as_ref().and_then(Weak::upgrade) {
            Some(scheduler) => match waiter {
                Waiter::Fiber(fiber) => scheduler.schedule_fiber(fiber, None),
                Waiter::Callback(callback) => scheduler.schedule(Task::Callback(callback), None),
            },
            None => {
                tracing::warn!(target: crate::LOG_TARGET, fd, ?event, "scheduler of event waiter is gone");
            }
        }
    }
}

/// Event slots of one descriptor
struct FdEvents {
    inner: Mutex<FdEventsInner>,
}

impl FdEvents {
    fn new() -> Self {
        Self {
            inner: Mutex::new(FdEventsInner {
                armed: Event::empty(),
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }
}

fn op_name(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_MOD => "MOD",
        libc::EPOLL_CTL_DEL => "DEL",
        _ => "?",
    }
}

fn close_fd(fd: RawFd) {
    // SAFETY: closing a descriptor this module owns.
    unsafe { (sys::originals().close)(fd) };
}

/// Epoll reactor driving the idle fibers of an IoManager
pub(crate) struct Reactor {
    epfd: RawFd,
    /// `[read, write]` ends of the wake-up pipe
    tickle_fds: [RawFd; 2],
    fd_events: RwLock<Vec<Arc<FdEvents>>>,
    /// Armed directions across all descriptors
    pending_events: AtomicUsize,
    timers: TimerManager,
    scheduler: OnceLock<Weak<Scheduler>>,
    max_wait_ms: u64,
    max_events: usize,
}

impl Reactor {
    fn new() -> Result<Arc<Reactor>> {
        // SAFETY: plain syscalls; every descriptor is closed on failure.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::EpollCreate(io::Error::last_os_error()));
        }

        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            let err = io::Error::last_os_error();
            close_fd(epfd);
            return Err(Error::Pipe(err));
        }

        let events = EPOLLIN | EPOLLET;
        let mut event = libc::epoll_event {
            events,
            u64: fds[0] as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut event) } != 0 {
            let source = io::Error::last_os_error();
            close_fd(fds[0]);
            close_fd(fds[1]);
            close_fd(epfd);
            return Err(Error::EpollCtl {
                op: "ADD",
                fd: fds[0],
                events,
                source,
            });
        }

        let config = config::current();
        let reactor = Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let timers = TimerManager::new();
            let observer: Weak<dyn TimerObserver> = weak.clone();
            timers.set_observer(observer);
            Reactor {
                epfd,
                tickle_fds: fds,
                fd_events: RwLock::new(Vec::new()),
                pending_events: AtomicUsize::new(0),
                timers,
                scheduler: OnceLock::new(),
                max_wait_ms: config.reactor_max_wait_ms,
                max_events: config.reactor_max_events,
            }
        });
        reactor.resize(INITIAL_FD_SLOTS);
        tracing::debug!(target: crate::LOG_TARGET, epfd, tickle = fds[0], "reactor created");
        Ok(reactor)
    }

    fn resize(&self, len: usize) {
        let mut table = self.fd_events.write();
        while table.len() < len {
            table.push(Arc::new(FdEvents::new()));
        }
    }

    /// Slots of `fd`, growing the table by half when `grow` is set.
    fn fd_events(&self, fd: RawFd, grow: bool) -> Option<Arc<FdEvents>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let table = self.fd_events.read();
            if let Some(slot) = table.get(idx) {
                return Some(Arc::clone(slot));
            }
        }
        if !grow {
            return None;
        }
        self.resize((idx * 3 / 2).max(idx + 1));
        self.fd_events.read().get(idx).cloned()
    }

    fn epoll_ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> Result<()> {
        let mut event = libc::epoll_event { events, u64: fd as u64 };
        // SAFETY: `event` outlives the call.
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) } != 0 {
            let err = Error::EpollCtl {
                op: op_name(op),
                fd,
                events,
                source: io::Error::last_os_error(),
            };
            tracing::error!(target: crate::LOG_TARGET, %err, "epoll_ctl failed");
            return Err(err);
        }
        Ok(())
    }

    fn owner(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.get().and_then(Weak::upgrade)
    }

    fn add_event(&self, fd: RawFd, event: Event, callback: Option<Box<dyn FnOnce() + Send + 'static>>) -> Result<()> {
        if fd < 0 {
            return Err(Error::InvalidFd(fd));
        }
        weft_assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes exactly one direction, got {:?}",
            event
        );
        let waiter = match callback {
            Some(callback) => Waiter::Callback(callback),
            None => Waiter::Fiber(Fiber::current_task_fiber().ok_or(Error::NoCurrentFiber)?),
        };
        let scheduler = local::scheduler()
            .or_else(|| self.owner())
            .map(|s| Arc::downgrade(&s));

        let slot = self.fd_events(fd, true).ok_or(Error::InvalidFd(fd))?;
        let mut inner = slot.inner.lock();
        if inner.armed.intersects(event) {
            fatal!("add_event fd={} {:?} already armed ({:?})", fd, event, inner.armed);
        }

        let op = if inner.armed.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_ctl(op, fd, EPOLLET | (inner.armed | event).bits())?;

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        inner.armed |= event;
        let ctx = inner.context_mut(event);
        weft_assert!(ctx.is_empty(), "fd {} {:?} context not empty", fd, event);
        ctx.scheduler = scheduler;
        ctx.waiter = Some(waiter);
        Ok(())
    }

    /// Disarm `event` on `fd`; the waiter is dropped when `trigger` is false
    /// and scheduled when it is true.
    fn remove_event(&self, fd: RawFd, event: Event, trigger: bool) -> bool {
        let Some(slot) = self.fd_events(fd, false) else {
            return false;
        };
        let mut inner = slot.inner.lock();
        if !inner.armed.intersects(event) {
            return false;
        }
        let event = inner.armed & event;
        let left = inner.armed - event;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_ctl(op, fd, EPOLLET | left.bits()).is_err() {
            return false;
        }

        for direction in [Event::READ, Event::WRITE] {
            if !event.contains(direction) {
                continue;
            }
            if trigger {
                inner.trigger(fd, direction);
            } else {
                inner.armed.remove(direction);
                inner.context_mut(direction).reset();
            }
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        true
    }

    fn armed_events(&self, fd: RawFd) -> Event {
        self.fd_events(fd, false)
            .map_or(Event::empty(), |slot| slot.inner.lock().armed)
    }

    fn write_tickle(&self) {
        let byte = b"T";
        // SAFETY: one byte from a static buffer into our own pipe.
        let rt = unsafe { (sys::originals().write)(self.tickle_fds[1], byte.as_ptr().cast(), 1) };
        if rt != 1 && util::errno() != libc::EAGAIN {
            tracing::warn!(
                target: crate::LOG_TARGET,
                error = %io::Error::last_os_error(),
                "tickle write failed"
            );
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        // SAFETY: reading into a local buffer from our own non-blocking pipe.
        while unsafe { (sys::originals().read)(self.tickle_fds[0], buf.as_mut_ptr().cast(), buf.len()) } > 0 {}
    }

    /// Turn one epoll readiness report into triggered waiters.
    fn dispatch_ready(&self, fd: RawFd, revents: u32) {
        let Some(slot) = self.fd_events(fd, false) else {
            return;
        };
        let mut inner = slot.inner.lock();

        let mut real = Event::empty();
        if revents & (EPOLLERR | EPOLLHUP) != 0 {
            real |= inner.armed;
        }
        if revents & EPOLLIN != 0 {
            real |= Event::READ;
        }
        if revents & EPOLLOUT != 0 {
            real |= Event::WRITE;
        }
        real &= inner.armed;
        if real.is_empty() {
            return;
        }

        let left = inner.armed - real;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_ctl(op, fd, EPOLLET | left.bits()).is_err() {
            return;
        }

        for direction in [Event::READ, Event::WRITE] {
            if real.contains(direction) {
                inner.trigger(fd, direction);
                self.pending_events.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl SchedulerDriver for Reactor {
    fn tickle(&self, scheduler: &Scheduler) {
        if !scheduler.has_idle_threads() {
            return;
        }
        tracing::trace!(target: crate::LOG_TARGET, name = scheduler.name(), "tickle");
        self.write_tickle();
    }

    fn stopping(&self, scheduler: &Scheduler) -> bool {
        !self.timers.has_timer()
            && self.pending_events.load(Ordering::Acquire) == 0
            && scheduler.base_stopping()
    }

    fn idle(&self, scheduler: &Arc<Scheduler>) {
        tracing::debug!(target: crate::LOG_TARGET, name = scheduler.name(), "reactor idle");
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];

        loop {
            if self.stopping(scheduler) {
                tracing::debug!(target: crate::LOG_TARGET, name = scheduler.name(), "reactor exiting");
                // Siblings blocked in epoll_wait must see the stop too.
                self.write_tickle();
                break;
            }

            let timeout_ms = self
                .timers
                .next_timer()
                .map_or(self.max_wait_ms, |d| (d.as_millis() as u64).min(self.max_wait_ms));
            let ready = loop {
                // SAFETY: `events` has room for `events.len()` entries.
                let n = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        events.len() as libc::c_int,
                        timeout_ms as libc::c_int,
                    )
                };
                if n < 0 && util::errno() == libc::EINTR {
                    continue;
                }
                break n;
            };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if wait_error_is_fatal(err.raw_os_error().unwrap_or(0)) {
                    fatal!("epoll_wait on epfd {} failed: {}", self.epfd, err);
                }
                tracing::error!(target: crate::LOG_TARGET, error = %err, "epoll_wait failed, backing off");
                thread::sleep(WAIT_ERROR_BACKOFF);
            }

            let expired = self.timers.list_expired_callbacks();
            if !expired.is_empty() {
                scheduler.schedule_batch(expired.into_iter().map(|cb| Task::callback(move || cb())));
            }

            let ready = ready.max(0) as usize;
            tracing::trace!(target: crate::LOG_TARGET, ready, timeout_ms, "epoll batch");
            for event in &events[..ready] {
                let fd = event.u64 as RawFd;
                let revents = event.events;
                if fd == self.tickle_fds[0] {
                    self.drain_tickle();
                    continue;
                }
                self.dispatch_ready(fd, revents);
            }

            Fiber::yield_to_hold();
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl TimerObserver for Reactor {
    fn on_timer_inserted_at_front(&self) {
        if let Some(scheduler) = self.owner() {
            self.tickle(&scheduler);
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        close_fd(self.tickle_fds[0]);
        close_fd(self.tickle_fds[1]);
        close_fd(self.epfd);
        tracing::debug!(target: crate::LOG_TARGET, epfd = self.epfd, "reactor destroyed");
    }
}

/// A running scheduler whose idle workers wait on epoll and timers
#[derive(Clone)]
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    reactor: Arc<Reactor>,
}

impl IoManager {
    /// Create and start an IoManager.
    ///
    /// Arguments are those of [`Scheduler::new`]. The workers run until
    /// [`IoManager::stop`].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<IoManager> {
        let reactor = Reactor::new()?;
        let scheduler = Scheduler::with_driver(threads, use_caller, name, reactor.clone());
        let _ = reactor.scheduler.set(Arc::downgrade(&scheduler));
        scheduler.start()?;
        Ok(IoManager { scheduler, reactor })
    }

    /// The IoManager the calling thread works for.
    pub fn current() -> Option<IoManager> {
        let scheduler = Scheduler::current()?;
        let reactor = Arc::clone(scheduler.driver()).as_any().downcast::<Reactor>().ok()?;
        Some(IoManager { scheduler, reactor })
    }

    /// Underlying scheduler
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Name of the underlying scheduler
    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    /// OS thread ids of the workers
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.scheduler.thread_ids()
    }

    /// Queue a task. See [`Scheduler::schedule`].
    pub fn schedule(&self, task: Task, thread: Option<Tid>) {
        self.scheduler.schedule(task, thread);
    }

    /// Queue a closure.
    pub fn schedule_fn<F>(&self, f: F, thread: Option<Tid>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule_fn(f, thread);
    }

    /// Wait for `event` on `fd`.
    ///
    /// With a callback, the callback is scheduled when the event fires.
    /// Without one, the calling fiber is the waiter and is expected to
    /// `Fiber::yield_to_hold` right after. Arming an already armed direction
    /// is fatal.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        callback: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<()> {
        self.reactor.add_event(fd, event, callback)
    }

    /// Disarm `event` without waking its waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.remove_event(fd, event, false)
    }

    /// Disarm `event` and wake its waiter as if the event had fired.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        self.reactor.remove_event(fd, event, true)
    }

    /// Cancel every armed direction of `fd`.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        self.reactor.remove_event(fd, Event::READ | Event::WRITE, true)
    }

    /// Directions currently armed on `fd`
    pub fn armed_events(&self, fd: RawFd) -> Event {
        self.reactor.armed_events(fd)
    }

    /// Armed directions across all descriptors
    pub fn pending_event_count(&self) -> usize {
        self.reactor.pending_events.load(Ordering::Acquire)
    }

    /// Timer set driving the reactor's wait timeout
    pub fn timers(&self) -> &TimerManager {
        &self.reactor.timers
    }

    /// See [`TimerManager::add_timer`]. The callback runs on a worker.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reactor.timers.add_timer(ms, callback, recurring)
    }

    /// See [`TimerManager::add_condition_timer`].
    pub fn add_condition_timer<F, T>(&self, ms: u64, callback: F, guard: Weak<T>, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.reactor.timers.add_condition_timer(ms, callback, guard, recurring)
    }

    /// Stop once no work, armed events or timers remain, and join the workers.
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &self.scheduler)
            .field("pending_events", &self.pending_event_count())
            .field("timers", &self.reactor.timers.timer_count())
            .finish()
    }
}
