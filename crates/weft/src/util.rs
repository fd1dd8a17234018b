//! Small OS helpers shared by the runtime

use once_cell::sync::Lazy;
use std::time::Instant;

/// Kernel thread id type used for scheduler affinity
pub type Tid = libc::pid_t;

/// Kernel thread id of the calling thread (`gettid`).
pub fn thread_id() -> Tid {
    // SAFETY: gettid has no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as Tid }
}

// Out of line like the `local` accessors: a fiber that parked on one worker
// may resume on another, and an inlined `__errno_location()` result would
// still point at the first thread's slot.

/// Current value of `errno` for the calling thread.
#[inline(never)]
pub fn errno() -> i32 {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    unsafe { *libc::__errno_location() }
}

/// Overwrite `errno` for the calling thread.
#[inline(never)]
pub fn set_errno(value: i32) {
    // SAFETY: see `errno`.
    unsafe { *libc::__errno_location() = value }
}

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds on the monotonic clock since the runtime was first used.
pub fn monotonic_ms() -> u64 {
    PROCESS_EPOCH.elapsed().as_millis() as u64
}
