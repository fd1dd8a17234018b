//! M:N scheduler multiplexing fibers and callbacks onto a thread pool
//!
//! Work is submitted as a [`Task`] with an optional thread affinity and kept
//! in a single FIFO queue. Every worker runs the dispatch loop: pop the first
//! eligible item, resume it, decide what to do with it once it yields, and
//! fall back to the idle fiber when nothing is eligible.
//!
//! What "idle" means is up to the [`SchedulerDriver`]. A plain scheduler
//! spins cooperatively; the IoManager waits on epoll.

use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberState};
use crate::local;
use crate::util::{self, Tid};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A unit of work for the scheduler
pub enum Task {
    /// Resume this fiber
    Fiber(Arc<Fiber>),

    /// Run this callback on a (reused) callback fiber
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl Task {
    /// Wrap a closure as a callback task.
    pub fn callback<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Callback(Box::new(f))
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Fiber(fiber) => f.debug_tuple("Fiber").field(&fiber.id()).finish(),
            Task::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Queued task plus its thread affinity
struct WorkItem {
    task: Task,
    /// Run only on the worker with this OS thread id
    thread: Option<Tid>,
}

/// Hooks a concrete scheduler plugs into the dispatch loop
pub trait SchedulerDriver: Send + Sync + 'static {
    /// Wake an idle worker.
    fn tickle(&self, scheduler: &Scheduler);

    /// Whether the dispatch loop may exit.
    fn stopping(&self, scheduler: &Scheduler) -> bool;

    /// Body of the per-worker idle fiber. Must return once `stopping` holds
    /// and yield (`Fiber::yield_to_hold`) whenever new work may have arrived.
    fn idle(&self, scheduler: &Arc<Scheduler>);

    /// Upcast for recovering the concrete driver.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Driver of a plain scheduler: no reactor, the idle fiber polls.
struct CooperativeIdle;

impl SchedulerDriver for CooperativeIdle {
    fn tickle(&self, scheduler: &Scheduler) {
        tracing::trace!(target: crate::LOG_TARGET, name = %scheduler.name, "tickle");
    }

    fn stopping(&self, scheduler: &Scheduler) -> bool {
        scheduler.base_stopping()
    }

    fn idle(&self, scheduler: &Arc<Scheduler>) {
        tracing::debug!(target: crate::LOG_TARGET, name = %scheduler.name, "idle");
        while !scheduler.stopping() {
            thread::sleep(Duration::from_micros(100));
            Fiber::yield_to_hold();
        }
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Fixed thread pool running fibers and callbacks
pub struct Scheduler {
    /// Name, also the prefix of worker thread names
    name: String,

    /// Idle/tickle/stopping hooks
    driver: Arc<dyn SchedulerDriver>,

    /// Pending work, FIFO
    queue: Mutex<VecDeque<WorkItem>>,

    /// Spawned worker threads
    threads: Mutex<Vec<JoinHandle<()>>>,

    /// OS thread ids of all workers (the caller thread included)
    thread_ids: RwLock<Vec<Tid>>,

    /// Number of threads `start` spawns
    spawn_count: usize,

    /// Workers currently running a task
    active_threads: AtomicUsize,

    /// Workers currently inside the idle fiber
    idle_threads: AtomicUsize,

    /// Not running (true before `start` and after `stop`)
    stopping: AtomicBool,

    /// `stop` has been requested
    auto_stop: AtomicBool,

    /// Caller thread in use-caller mode
    root_thread: Option<Tid>,

    /// Dispatch fiber of the caller thread in use-caller mode
    root_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl Scheduler {
    /// Create a plain scheduler.
    ///
    /// `threads == 0` uses one thread per CPU. With `use_caller` the calling
    /// thread counts as one of the workers: it runs the dispatch loop when
    /// [`Scheduler::stop`] is called, and one fewer thread is spawned.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::with_driver(threads, use_caller, name, Arc::new(CooperativeIdle))
    }

    /// Create a scheduler whose idle behaviour comes from `driver`.
    pub fn with_driver(
        threads: usize,
        use_caller: bool,
        name: &str,
        driver: Arc<dyn SchedulerDriver>,
    ) -> Arc<Scheduler> {
        let threads = if threads == 0 { num_cpus::get() } else { threads };
        let caller_tid = util::thread_id();

        if use_caller {
            // The caller's own stack becomes the thread root.
            Fiber::current();
            weft_assert!(
                local::scheduler().is_none(),
                "thread {} already belongs to a scheduler",
                caller_tid
            );
        }

        let scheduler = Arc::new(Scheduler {
            name: name.to_string(),
            driver,
            queue: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: RwLock::new(Vec::new()),
            spawn_count: if use_caller { threads - 1 } else { threads },
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            root_thread: use_caller.then_some(caller_tid),
            root_fiber: Mutex::new(None),
        });

        if use_caller {
            let weak = Arc::downgrade(&scheduler);
            let root_fiber = Fiber::new(
                move || {
                    if let Some(scheduler) = weak.upgrade() {
                        scheduler.run();
                    }
                },
                0,
                true,
            );
            local::set_scheduler(Arc::downgrade(&scheduler));
            local::set_scheduler_fiber(Some(root_fiber.clone()));
            *scheduler.root_fiber.lock() = Some(root_fiber);
            scheduler.thread_ids.write().push(caller_tid);
        }

        tracing::debug!(
            target: crate::LOG_TARGET,
            name,
            threads,
            use_caller,
            "scheduler created"
        );
        scheduler
    }

    /// The scheduler the calling thread works for.
    pub fn current() -> Option<Arc<Scheduler>> {
        local::scheduler()
    }

    /// Scheduler name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn driver(&self) -> &Arc<dyn SchedulerDriver> {
        &self.driver
    }

    /// OS thread ids of the workers, usable as task affinity.
    pub fn thread_ids(&self) -> Vec<Tid> {
        self.thread_ids.read().clone()
    }

    /// Tasks waiting in the queue
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Workers currently running a task
    pub fn active_thread_count(&self) -> usize {
        self.active_threads.load(Ordering::Acquire)
    }

    /// Workers currently in their idle fiber
    pub fn idle_thread_count(&self) -> usize {
        self.idle_threads.load(Ordering::Acquire)
    }

    /// Whether any worker is idle.
    pub fn has_idle_threads(&self) -> bool {
        self.idle_thread_count() > 0
    }

    /// Queue a task, optionally pinned to the worker with OS thread id `thread`.
    pub fn schedule(&self, task: Task, thread: Option<Tid>) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(WorkItem { task, thread });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queue a closure.
    pub fn schedule_fn<F>(&self, f: F, thread: Option<Tid>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::callback(f), thread);
    }

    /// Queue a fiber for resumption.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<Tid>) {
        self.schedule(Task::Fiber(fiber), thread);
    }

    /// Queue several unpinned tasks with at most one tickle.
    pub fn schedule_batch<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            let before = queue.len();
            queue.extend(tasks.into_iter().map(|task| WorkItem { task, thread: None }));
            was_empty && queue.len() > before
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Spawn the worker threads. Calling it on a running scheduler does nothing.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut threads = self.threads.lock();
        if !self.stopping.load(Ordering::Acquire) {
            return Ok(());
        }
        self.stopping.store(false, Ordering::Release);
        weft_assert!(threads.is_empty(), "scheduler {} restarted with live threads", self.name);

        let (tid_tx, tid_rx) = crossbeam::channel::bounded(self.spawn_count.max(1));
        for i in 0..self.spawn_count {
            let scheduler = Arc::clone(self);
            let tid_tx = tid_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_{}", self.name, i))
                .spawn(move || {
                    let _ = tid_tx.send(util::thread_id());
                    drop(tid_tx);
                    scheduler.run();
                })
                .map_err(Error::Spawn)?;
            threads.push(handle);
        }
        drop(tid_tx);

        let mut ids = self.thread_ids.write();
        for tid in tid_rx.iter().take(self.spawn_count) {
            ids.push(tid);
        }
        tracing::info!(
            target: crate::LOG_TARGET,
            name = %self.name,
            spawned = self.spawn_count,
            "scheduler started"
        );
        Ok(())
    }

    /// Stop the scheduler and wait for all queued work to finish.
    ///
    /// In use-caller mode this must be called on the creating thread, which
    /// then runs the dispatch loop until the queue drains. Otherwise it must
    /// not be called from one of the scheduler's own workers.
    pub fn stop(self: &Arc<Self>) {
        self.auto_stop.store(true, Ordering::Release);
        let root_fiber = self.root_fiber.lock().clone();

        if let Some(root) = &root_fiber {
            if self.spawn_count == 0 && matches!(root.state(), FiberState::Init | FiberState::Term) {
                self.stopping.store(true, Ordering::Release);
                if self.stopping() {
                    self.release_caller_thread();
                    return;
                }
            }
        }

        if self.root_thread.is_some() {
            weft_assert!(
                local::is_current_scheduler(self),
                "stop() of use-caller scheduler {} called from another thread",
                self.name
            );
        } else {
            weft_assert!(
                !local::is_current_scheduler(self),
                "stop() of scheduler {} called from its own worker",
                self.name
            );
        }

        self.stopping.store(true, Ordering::Release);
        for _ in 0..self.spawn_count {
            self.tickle();
        }
        if root_fiber.is_some() {
            self.tickle();
        }

        if let Some(root) = &root_fiber {
            if !self.stopping() && !root.state().is_finished() {
                root.call();
            }
        }

        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!(target: crate::LOG_TARGET, name = %self.name, "worker thread panicked");
            }
        }
        self.release_caller_thread();
        tracing::info!(target: crate::LOG_TARGET, name = %self.name, "scheduler stopped");
    }

    /// Unbind the caller thread once its dispatch fiber is done.
    fn release_caller_thread(&self) {
        if self.root_thread == Some(util::thread_id()) {
            local::set_scheduler_fiber(None);
            local::set_scheduler(Weak::new());
        }
    }

    /// Wake an idle worker through the driver.
    pub fn tickle(&self) {
        self.driver.tickle(self);
    }

    /// Whether the dispatch loop may exit, as decided by the driver.
    pub fn stopping(&self) -> bool {
        self.driver.stopping(self)
    }

    /// The plain condition: stop requested, queue empty, no task mid-run.
    pub fn base_stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active_threads.load(Ordering::Acquire) == 0
    }

    /// Next eligible task for the worker `tid`.
    ///
    /// Sets `tickle_me` when work remains that this worker cannot or did not
    /// take. Reports `skipped_running` when only fibers still switching out on
    /// another thread were left.
    fn next_task(&self, tid: Tid, tickle_me: &mut bool, skipped_running: &mut bool) -> Option<Task> {
        let mut queue = self.queue.lock();
        let mut i = 0;
        while i < queue.len() {
            let item = &queue[i];
            if item.thread.is_some_and(|t| t != tid) {
                *tickle_me = true;
                i += 1;
                continue;
            }
            if let Task::Fiber(fiber) = &item.task {
                if fiber.is_running() {
                    *skipped_running = true;
                    i += 1;
                    continue;
                }
            }
            let item = queue.remove(i)?;
            self.active_threads.fetch_add(1, Ordering::AcqRel);
            *tickle_me |= i < queue.len();
            return Some(item.task);
        }
        None
    }

    /// Dispatch loop executed by every worker.
    fn run(self: &Arc<Self>) {
        let tid = util::thread_id();
        tracing::debug!(target: crate::LOG_TARGET, name = %self.name, tid, "worker running");

        let hook_was_enabled = local::hook_enabled();
        local::set_hook_enabled(true);
        local::set_scheduler(Arc::downgrade(self));
        if self.root_thread != Some(tid) {
            local::set_scheduler_fiber(Some(Fiber::current()));
        }

        let weak = Arc::downgrade(self);
        let idle = Fiber::new(
            move || {
                if let Some(scheduler) = weak.upgrade() {
                    let driver = Arc::clone(&scheduler.driver);
                    driver.idle(&scheduler);
                }
            },
            0,
            false,
        );
        let mut callback_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut skipped_running = false;
            let task = self.next_task(tid, &mut tickle_me, &mut skipped_running);

            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Task::Fiber(fiber)) => {
                    if fiber.state().is_finished() {
                        self.active_threads.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                    let state = fiber.resume_for_dispatch();
                    self.active_threads.fetch_sub(1, Ordering::AcqRel);
                    if state == FiberState::Ready {
                        self.schedule(Task::Fiber(fiber), None);
                    }
                }
                Some(Task::Callback(callback)) => {
                    let fiber = match callback_fiber.take() {
                        Some(fiber) => {
                            fiber.reset_boxed(Some(callback));
                            fiber
                        }
                        None => Fiber::from_boxed(callback, 0, false),
                    };
                    let state = fiber.resume_for_dispatch();
                    self.active_threads.fetch_sub(1, Ordering::AcqRel);
                    match state {
                        FiberState::Ready => self.schedule(Task::Fiber(fiber), None),
                        FiberState::Term | FiberState::Except => callback_fiber = Some(fiber),
                        // Parked: whoever is going to wake it holds it now.
                        _ => {}
                    }
                }
                None if skipped_running => {
                    thread::yield_now();
                }
                None => {
                    if idle.state().is_finished() {
                        tracing::debug!(target: crate::LOG_TARGET, name = %self.name, tid, "idle fiber finished");
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::AcqRel);
                    idle.resume_for_dispatch();
                    self.idle_threads.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        if self.root_thread != Some(tid) {
            local::set_scheduler_fiber(None);
        }
        local::set_hook_enabled(hook_was_enabled);
        tracing::debug!(target: crate::LOG_TARGET, name = %self.name, tid, "worker exiting");
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("pending", &self.pending_count())
            .field("active", &self.active_thread_count())
            .field("idle", &self.idle_thread_count())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.stopping.load(Ordering::Acquire) {
            tracing::warn!(target: crate::LOG_TARGET, name = %self.name, "scheduler dropped without stop()");
        }
        tracing::debug!(target: crate::LOG_TARGET, name = %self.name, "scheduler destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callbacks_run_once() {
        let scheduler = Scheduler::new(2, false, "test_cb");
        scheduler.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let h = hits.clone();
            scheduler.schedule_fn(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }, None);
        }
        scheduler.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.active_thread_count(), 0);
    }

    #[test]
    fn test_start_is_idempotent() {
        let scheduler = Scheduler::new(2, false, "test_idem");
        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert_eq!(scheduler.thread_ids().len(), 2);
        scheduler.stop();
    }

    #[test]
    fn test_affinity_runs_on_pinned_thread() {
        let scheduler = Scheduler::new(3, false, "test_pin");
        scheduler.start().unwrap();
        let target = scheduler.thread_ids()[1];
        let (tx, rx) = crossbeam::channel::unbounded();
        for _ in 0..8 {
            let tx = tx.clone();
            scheduler.schedule_fn(move || {
                tx.send(util::thread_id()).unwrap();
            }, Some(target));
        }
        scheduler.stop();
        drop(tx);
        let seen: Vec<Tid> = rx.iter().collect();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|&t| t == target));
    }

    #[test]
    fn test_ready_fiber_is_requeued() {
        let scheduler = Scheduler::new(1, false, "test_ready");
        scheduler.start().unwrap();
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        scheduler.schedule_fn(move || {
            s.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
            s.fetch_add(1, Ordering::SeqCst);
        }, None);
        scheduler.stop();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_batch_schedule() {
        let scheduler = Scheduler::new(2, false, "test_batch");
        scheduler.start().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (0..5)
            .map(|_| {
                let h = hits.clone();
                Task::callback(move || {
                    h.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        scheduler.schedule_batch(tasks);
        scheduler.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_current_scheduler_inside_task() {
        let scheduler = Scheduler::new(1, false, "test_current");
        scheduler.start().unwrap();
        let (tx, rx) = crossbeam::channel::bounded(1);
        scheduler.schedule_fn(move || {
            let name = Scheduler::current().map(|s| s.name().to_string());
            tx.send(name).unwrap();
        }, None);
        assert_eq!(rx.recv().unwrap().as_deref(), Some("test_current"));
        scheduler.stop();
        assert!(Scheduler::current().is_none());
    }
}
