//! Per-thread runtime registry
//!
//! Every OS thread that touches the runtime carries one [`Local`]: the fiber
//! currently executing, the thread's root fiber (its original stack), the
//! fiber the dispatch loop runs on, the scheduler driving the thread and the
//! hook flag. Accessors never hold a `RefCell` borrow across a context switch.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::sync::{Arc, Weak};

struct Local {
    /// Fiber in `Exec` on this thread
    current: RefCell<Option<Arc<Fiber>>>,
    /// Implicit fiber owning the thread's original stack
    thread_root: RefCell<Option<Arc<Fiber>>>,
    /// Fiber running the dispatch loop (defaults to `thread_root`)
    scheduler_fiber: RefCell<Option<Arc<Fiber>>>,
    /// Scheduler this thread works for
    scheduler: RefCell<Weak<Scheduler>>,
    /// Whether blocking-style calls should park the fiber
    hook_enabled: Cell<bool>,
}

thread_local! {
    static LOCAL: Local = Local {
        current: RefCell::new(None),
        thread_root: RefCell::new(None),
        scheduler_fiber: RefCell::new(None),
        scheduler: RefCell::new(Weak::new()),
        hook_enabled: Cell::new(false),
    };
}

// Accessors are kept out of line so a fiber that migrates between threads
// always re-reads the thread-local block of the thread it runs on.

#[inline(never)]
pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    LOCAL.with(|l| l.current.borrow().clone())
}

#[inline(never)]
pub(crate) fn has_current_fiber() -> bool {
    LOCAL.with(|l| l.current.borrow().is_some())
}

/// Install `fiber` as current and return the previous one.
#[inline(never)]
pub(crate) fn replace_current_fiber(fiber: Arc<Fiber>) -> Option<Arc<Fiber>> {
    LOCAL.with(|l| l.current.borrow_mut().replace(fiber))
}

#[inline(never)]
pub(crate) fn thread_root() -> Option<Arc<Fiber>> {
    LOCAL.with(|l| l.thread_root.borrow().clone())
}

#[inline(never)]
pub(crate) fn set_thread_root(fiber: Arc<Fiber>) {
    let old = LOCAL.with(|l| l.thread_root.borrow_mut().replace(fiber));
    drop(old);
}

/// Fiber that `swap_out` returns to: the dispatch fiber if one is installed,
/// otherwise the thread root.
#[inline(never)]
pub(crate) fn main_fiber() -> Option<Arc<Fiber>> {
    LOCAL.with(|l| {
        l.scheduler_fiber
            .borrow()
            .clone()
            .or_else(|| l.thread_root.borrow().clone())
    })
}

#[inline(never)]
pub(crate) fn set_scheduler_fiber(fiber: Option<Arc<Fiber>>) {
    let old = LOCAL.with(|l| std::mem::replace(&mut *l.scheduler_fiber.borrow_mut(), fiber));
    drop(old);
}

#[inline(never)]
pub(crate) fn scheduler() -> Option<Arc<Scheduler>> {
    LOCAL.with(|l| l.scheduler.borrow().upgrade())
}

#[inline(never)]
pub(crate) fn is_current_scheduler(scheduler: &Arc<Scheduler>) -> bool {
    LOCAL.with(|l| std::ptr::eq(l.scheduler.borrow().as_ptr(), Arc::as_ptr(scheduler)))
}

#[inline(never)]
pub(crate) fn set_scheduler(scheduler: Weak<Scheduler>) {
    LOCAL.with(|l| *l.scheduler.borrow_mut() = scheduler);
}

#[inline(never)]
pub(crate) fn hook_enabled() -> bool {
    LOCAL.with(|l| l.hook_enabled.get())
}

#[inline(never)]
pub(crate) fn set_hook_enabled(enabled: bool) {
    LOCAL.with(|l| l.hook_enabled.set(enabled));
}
