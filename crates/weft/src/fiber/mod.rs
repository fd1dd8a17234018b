//! Stackful coroutines
//!
//! A [`Fiber`] owns a stack and a saved register context. Resuming it
//! ([`Fiber::swap_in`]) switches the calling thread onto the fiber's stack
//! until the fiber yields back ([`Fiber::swap_out`], [`Fiber::yield_to_ready`],
//! [`Fiber::yield_to_hold`]) or its body returns.
//!
//! Every thread also has an implicit root fiber that stands for its original
//! stack. It is created the first time the thread asks for
//! [`Fiber::current`] and never runs a callback.

mod context;
mod stack;

use crate::config;
use crate::local;
use context::Context;
use parking_lot::Mutex;
use stack::Stack;
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Body of a fiber
pub(crate) type FiberFn = Box<dyn FnOnce() + Send + 'static>;

/// Unique identifier for a Fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

impl FiberId {
    fn next() -> Self {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric id value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// Execution state of a Fiber
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created or reset, never resumed
    Init = 0,
    /// Executing on a thread
    Exec = 1,
    /// Suspended until something external reschedules it
    Hold = 2,
    /// Suspended but runnable; the scheduler re-queues it
    Ready = 3,
    /// Body returned
    Term = 4,
    /// Body panicked
    Except = 5,
}

impl FiberState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberState::Init,
            1 => FiberState::Exec,
            2 => FiberState::Hold,
            3 => FiberState::Ready,
            4 => FiberState::Term,
            _ => FiberState::Except,
        }
    }

    /// `Term` or `Except`
    pub fn is_finished(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }
}

/// A stackful, resumable execution context
pub struct Fiber {
    /// Unique identifier
    id: FiberId,

    /// Current [`FiberState`]
    state: AtomicU8,

    /// Set while some thread is executing on this fiber's stack, cleared by
    /// the resuming thread once the fiber's context has been saved again
    running: AtomicBool,

    /// Entry returns through `back()` instead of `swap_out()`
    run_as_caller: bool,

    /// Owned stack; `None` for a thread root fiber
    stack: Option<Stack>,

    /// Saved registers
    ctx: UnsafeCell<Context>,

    /// Body, taken by the entry trampoline
    callback: Mutex<Option<FiberFn>>,

    /// Panic message when the body failed
    failure: Mutex<Option<String>>,
}

// SAFETY: `ctx` is only touched by the thread that is switching into or out
// of the fiber, and the `running` flag keeps two threads from doing so at once.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that runs `f` when first resumed.
    ///
    /// `stack_size == 0` uses the configured default. With `run_as_caller`
    /// the fiber returns to the thread root when it finishes (the pairing used
    /// by [`Fiber::call`]) instead of the scheduler's main fiber.
    pub fn new<F>(f: F, stack_size: usize, run_as_caller: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_boxed(Box::new(f), stack_size, run_as_caller)
    }

    pub(crate) fn from_boxed(f: FiberFn, stack_size: usize, run_as_caller: bool) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            config::current().fiber_stack_size
        } else {
            stack_size
        };
        let stack = match Stack::new(size) {
            Ok(stack) => stack,
            Err(e) => fatal!("failed to allocate a {} byte fiber stack: {}", size, e),
        };
        let ctx = Context::with_stack(&stack, fiber_main);
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Init as u8),
            running: AtomicBool::new(false),
            run_as_caller,
            stack: Some(stack),
            ctx: UnsafeCell::new(ctx),
            callback: Mutex::new(Some(f)),
            failure: Mutex::new(None),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: crate::LOG_TARGET, id = %fiber.id, size, "fiber created");
        fiber
    }

    /// Root fiber for the calling thread's own stack
    fn new_root() -> Arc<Fiber> {
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Exec as u8),
            running: AtomicBool::new(true),
            run_as_caller: false,
            stack: None,
            ctx: UnsafeCell::new(Context::capture()),
            callback: Mutex::new(None),
            failure: Mutex::new(None),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: crate::LOG_TARGET, id = %fiber.id, "thread root fiber created");
        fiber
    }

    /// Unique identifier
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether a thread is on this fiber's stack or still switching off it.
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether this is a thread root fiber (no owned stack).
    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    /// Lowest usable address of the stack, if the fiber owns one.
    pub fn stack_base(&self) -> Option<usize> {
        self.stack.as_ref().map(|s| s.bottom() as usize)
    }

    /// Panic message captured when the fiber ended in `Except`.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Reuse this fiber's stack for a new body.
    ///
    /// Only valid on a fiber in `Init`, `Term` or `Except`; anything else is
    /// fatal, as is calling it on a thread root fiber.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Some(Box::new(f)));
    }

    pub(crate) fn reset_boxed(&self, f: Option<FiberFn>) {
        let Some(stack) = self.stack.as_ref() else {
            fatal!("reset called on thread root fiber {}", self.id);
        };
        let state = self.state();
        weft_assert!(
            matches!(state, FiberState::Init | FiberState::Term | FiberState::Except) && !self.is_running(),
            "fiber {} reset while {:?}",
            self.id,
            state
        );
        *self.callback.lock() = f;
        *self.failure.lock() = None;
        // SAFETY: the fiber is not running, so nobody else reads the context.
        unsafe { (*self.ctx.get()).prepare(stack, fiber_main) };
        self.set_state(FiberState::Init);
    }

    /// Resume this fiber from the thread's scheduler main fiber.
    ///
    /// Returns when the fiber yields or finishes.
    pub fn swap_in(self: &Arc<Self>) {
        let main = thread_main_fiber();
        self.resume_from(&main, false);
    }

    /// Resume from the dispatch loop and report the state the fiber left in.
    ///
    /// A fiber that switched away while still `Exec` is parked in `Hold`
    /// before it is released, so the returned state is exactly what another
    /// thread can observe once it may pick the fiber up.
    pub(crate) fn resume_for_dispatch(self: &Arc<Self>) -> FiberState {
        let main = thread_main_fiber();
        self.resume_from(&main, true)
    }

    /// Suspend this fiber and return to the thread's scheduler main fiber.
    pub fn swap_out(&self) {
        let main = thread_main_fiber();
        self.suspend_to(main);
    }

    /// Resume this fiber directly from the thread root.
    ///
    /// Pairs with [`Fiber::back`]; used for the dispatch fiber of a scheduler
    /// that runs on its creating thread.
    pub fn call(self: &Arc<Self>) {
        let root = thread_root_fiber();
        self.resume_from(&root, false);
    }

    /// Suspend this fiber and return directly to the thread root.
    pub fn back(&self) {
        let root = thread_root_fiber();
        self.suspend_to(root);
    }

    fn resume_from(self: &Arc<Self>, from: &Arc<Fiber>, hold_if_exec: bool) -> FiberState {
        if Arc::ptr_eq(self, from) {
            fatal!("fiber {} cannot resume itself", self.id);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            fatal!("fiber {} resumed while already running", self.id);
        }
        let state = self.state();
        weft_assert!(!state.is_finished(), "fiber {} resumed in state {:?}", self.id, state);

        self.set_state(FiberState::Exec);
        let previous = local::replace_current_fiber(self.clone());
        drop(previous);
        // SAFETY: `from` is the context of the code running here and `self`
        // is not running anywhere (checked through `running`).
        unsafe { Context::switch(from.ctx.get(), self.ctx.get()) };

        let mut state = self.state();
        if hold_if_exec && state == FiberState::Exec {
            self.set_state(FiberState::Hold);
            state = FiberState::Hold;
        }
        self.running.store(false, Ordering::Release);
        state
    }

    fn suspend_to(&self, target: Arc<Fiber>) {
        if std::ptr::eq(self, Arc::as_ptr(&target)) {
            tracing::warn!(target: crate::LOG_TARGET, id = %self.id, "fiber tried to switch to itself");
            return;
        }
        let target_ptr = Arc::as_ptr(&target);
        // The target stays alive through the thread-local slots that own it;
        // the resumer of `self` keeps holding its own reference.
        let previous = local::replace_current_fiber(target);
        drop(previous);
        // SAFETY: `self` is the running fiber; the target is suspended on this
        // thread and is resumed exactly once by this switch.
        unsafe { Context::switch(self.ctx.get(), (*target_ptr).ctx.get()) };
    }

    /// The fiber executing on this thread, creating the thread root if needed.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = local::current_fiber() {
            return fiber;
        }
        let root = Fiber::new_root();
        local::set_thread_root(root.clone());
        drop(local::replace_current_fiber(root.clone()));
        root
    }

    /// The current fiber, unless the thread is on its root stack.
    pub fn current_task_fiber() -> Option<Arc<Fiber>> {
        local::current_fiber().filter(|f| !f.is_root())
    }

    /// Id of the executing fiber, or 0 before any fiber existed on the thread.
    pub fn current_id() -> u64 {
        local::current_fiber().map_or(0, |f| f.id.as_u64())
    }

    /// Suspend the current fiber as still runnable.
    pub fn yield_to_ready() {
        Self::yield_with(FiberState::Ready);
    }

    /// Suspend the current fiber until something reschedules it.
    pub fn yield_to_hold() {
        Self::yield_with(FiberState::Hold);
    }

    fn yield_with(state: FiberState) {
        let current = Fiber::current();
        if current.is_root() {
            tracing::debug!(target: crate::LOG_TARGET, id = %current.id, "yield on a thread root is a no-op");
            return;
        }
        weft_assert!(
            current.state() == FiberState::Exec,
            "fiber {} yielded while {:?}",
            current.id,
            current.state()
        );
        current.set_state(state);
        current.swap_out();
    }

    /// Number of live fibers in the process (including thread roots).
    pub fn total_fibers() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("root", &self.is_root())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        let state = self.state();
        if self.stack.is_some() && !matches!(state, FiberState::Init | FiberState::Term | FiberState::Except) {
            tracing::warn!(target: crate::LOG_TARGET, id = %self.id, ?state, "suspended fiber dropped");
        }
        tracing::debug!(target: crate::LOG_TARGET, id = %self.id, "fiber destroyed");
    }
}

fn thread_root_fiber() -> Arc<Fiber> {
    if local::thread_root().is_none() {
        Fiber::current();
    }
    match local::thread_root() {
        Some(root) => root,
        None => fatal!("thread has no root fiber"),
    }
}

fn thread_main_fiber() -> Arc<Fiber> {
    if !local::has_current_fiber() {
        Fiber::current();
    }
    match local::main_fiber() {
        Some(main) => main,
        None => fatal!("thread has no main fiber"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Entry trampoline installed by `makecontext`.
extern "C" fn fiber_main() {
    let (raw, run_as_caller) = {
        let current = Fiber::current();
        let body = current.callback.lock().take();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
            if let Some(body) = body {
                body();
            }
        }));
        match outcome {
            Ok(()) => current.set_state(FiberState::Term),
            Err(payload) => {
                let message = panic_message(&*payload);
                tracing::warn!(target: crate::LOG_TARGET, id = %current.id, %message, "fiber panicked");
                *current.failure.lock() = Some(message);
                current.set_state(FiberState::Except);
            }
        }
        (Arc::as_ptr(&current), current.run_as_caller)
    };

    // No owning reference may stay on this stack: it is never unwound.
    // SAFETY: whoever resumed this fiber holds a reference until we switch away.
    unsafe {
        if run_as_caller {
            (*raw).back();
        } else {
            (*raw).swap_out();
        }
    }
    fatal!("finished fiber was resumed");
}
