//! Weft: stackful fibers on an M:N scheduler
//!
//! This crate provides the concurrency core for writing network servers in a
//! blocking style without a thread per connection:
//! - Fibers (stackful coroutines with their own call stack)
//! - Scheduler (a fixed thread pool multiplexing fibers and callbacks)
//! - Timers (deadline-ordered, with weakly guarded condition timers)
//! - IoManager (scheduler + timers + an edge-triggered epoll reactor)
//! - Hooks (blocking-style `read`/`write`/`connect`/`sleep` that park the
//!   calling fiber instead of the OS thread)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("weft requires Linux (epoll and ucontext)");

#[macro_use]
pub mod error;

pub mod config;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod io_manager;
pub mod scheduler;
pub mod timer;
pub mod util;

mod local;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use fd::{FdContext, FdManager, TimeoutKind};
pub use fiber::{Fiber, FiberId, FiberState};
pub use io_manager::{Event, IoManager};
pub use scheduler::{Scheduler, SchedulerDriver, Task};
pub use timer::{Clock, ManualClock, MonotonicClock, TimerCallback, TimerHandle, TimerManager, TimerObserver};

/// Log target shared by the runtime's internal diagnostics.
pub const LOG_TARGET: &str = "weft::system";
