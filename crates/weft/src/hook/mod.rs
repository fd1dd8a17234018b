//! Blocking-style I/O that parks the calling fiber
//!
//! Every function here has the libc prototype of the call it replaces. When
//! hooking is enabled for the thread (worker threads enable it while they
//! dispatch) and the descriptor is a socket the runtime manages, an
//! operation that would block registers interest with the current
//! [`IoManager`], parks the fiber and retries once woken. Otherwise the
//! original libc function is called unchanged.
//!
//! Socket timeouts set with `setsockopt(SO_RCVTIMEO / SO_SNDTIMEO)` are
//! honoured: the wait is cut short and the call fails with `ETIMEDOUT`.
//!
//! With the `interpose` feature the same functions are also exported under
//! the libc symbol names (the `interpose` module).

#[cfg(feature = "interpose")]
pub mod interpose;
pub(crate) mod sys;

use crate::config;
use crate::fd::{FdContext, FdManager, TimeoutKind};
use crate::fiber::Fiber;
use crate::io_manager::{Event, IoManager};
use crate::local;
use crate::timer::TimerHandle;
use crate::util::{errno, set_errno};
use libc::{c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, useconds_t};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

/// Whether hooked calls on this thread may park the current fiber.
pub fn is_hook_enabled() -> bool {
    local::hook_enabled()
}

/// Enable or disable hooking for this thread.
pub fn set_hook_enabled(enabled: bool) {
    local::set_hook_enabled(enabled);
}

/// Shared between a parked operation and its timeout timer
#[derive(Default)]
struct TimerInfo {
    /// errno to report once the timeout won (0 while it has not)
    cancelled: AtomicI32,
}

/// Socket context if the call should go through the park-and-retry path.
fn managed_socket(fd: RawFd) -> std::result::Result<Arc<FdContext>, Option<c_int>> {
    if !local::hook_enabled() {
        return Err(None);
    }
    let Some(ctx) = FdManager::global().get(fd, false) else {
        return Err(None);
    };
    if ctx.is_closed() {
        return Err(Some(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return Err(None);
    }
    Ok(ctx)
}

/// Arm a timer that cancels the wait for `event` after `ms`.
fn arm_timeout(iom: &IoManager, fd: RawFd, event: Event, ms: Option<u64>, info: &Arc<TimerInfo>) -> Option<TimerHandle> {
    let ms = ms?;
    let weak_info = Arc::downgrade(info);
    let canceller = iom.clone();
    Some(iom.add_condition_timer(
        ms,
        move || {
            let Some(info) = weak_info.upgrade() else {
                return;
            };
            if info
                .cancelled
                .compare_exchange(0, libc::ETIMEDOUT, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            canceller.cancel_event(fd, event);
        },
        Arc::downgrade(info),
        false,
    ))
}

/// Wait for `event` on `fd` from the current fiber, honouring the timeout.
///
/// Returns the errno that ended the wait early, if any.
fn park_on(iom: &IoManager, fd: RawFd, event: Event, timeout_ms: Option<u64>) -> Result<(), c_int> {
    let info = Arc::new(TimerInfo::default());
    let timer = arm_timeout(iom, fd, event, timeout_ms, &info);

    if let Err(err) = iom.add_event(fd, event, None) {
        tracing::warn!(target: crate::LOG_TARGET, fd, ?event, %err, "could not wait for descriptor");
        if let Some(timer) = timer {
            timer.cancel();
        }
        return Err(libc::EIO);
    }

    Fiber::yield_to_hold();

    if let Some(timer) = timer {
        timer.cancel();
    }
    match info.cancelled.load(Ordering::Acquire) {
        0 => Ok(()),
        errno => Err(errno),
    }
}

/// Run `op`, parking the current fiber whenever it reports `EAGAIN`.
///
/// `op` is the original non-blocking call; it is retried on `EINTR` and
/// after every wake-up.
pub fn do_io<F>(fd: RawFd, name: &'static str, event: Event, kind: TimeoutKind, mut op: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    let ctx = match managed_socket(fd) {
        Ok(ctx) => ctx,
        Err(Some(errno)) => {
            set_errno(errno);
            return -1;
        }
        Err(None) => return op(),
    };
    let timeout_ms = ctx.timeout_ms(kind);

    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let Some(iom) = IoManager::current() else {
            return n;
        };
        if Fiber::current_task_fiber().is_none() {
            return n;
        }
        tracing::trace!(target: crate::LOG_TARGET, fd, name, ?event, "would block, parking");
        if let Err(errno) = park_on(&iom, fd, event, timeout_ms) {
            set_errno(errno);
            return -1;
        }
        // Closed while parked; the descriptor number may already be reused.
        if ctx.is_closed() {
            set_errno(libc::EBADF);
            return -1;
        }
    }
}

/// Seconds plus milliseconds as a millisecond count. Negative fields count as
/// zero and the result saturates at `u64::MAX`.
fn duration_ms(secs: i64, millis: i64) -> u64 {
    (secs.max(0) as u64)
        .saturating_mul(1000)
        .saturating_add(millis.max(0) as u64)
}

/// Park the current fiber for `ms` milliseconds. `false` when there is no
/// fiber or IoManager to park on.
fn park_for(ms: u64) -> bool {
    let Some(iom) = IoManager::current() else {
        return false;
    };
    let Some(fiber) = Fiber::current_task_fiber() else {
        return false;
    };
    let scheduler = Arc::clone(iom.scheduler());
    iom.add_timer(ms, move || scheduler.schedule_fiber(Arc::clone(&fiber), None), false);
    Fiber::yield_to_hold();
    true
}

/// Hooked `sleep(3)`.
pub fn sleep(seconds: c_uint) -> c_uint {
    if local::hook_enabled() && park_for(u64::from(seconds) * 1000) {
        return 0;
    }
    // SAFETY: plain libc call.
    unsafe { (sys::originals().sleep)(seconds) }
}

/// Hooked `usleep(3)`.
pub fn usleep(usec: useconds_t) -> c_int {
    if local::hook_enabled() && park_for(u64::from(usec) / 1000) {
        return 0;
    }
    // SAFETY: plain libc call.
    unsafe { (sys::originals().usleep)(usec) }
}

/// Hooked `nanosleep(2)`.
///
/// # Safety
/// `req` and `rem` follow the libc contract.
pub unsafe fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    if local::hook_enabled() && !req.is_null() {
        let req_ref = &*req;
        let ms = duration_ms(req_ref.tv_sec as i64, req_ref.tv_nsec as i64 / 1_000_000);
        if park_for(ms) {
            return 0;
        }
    }
    (sys::originals().nanosleep)(req, rem)
}

/// Hooked `socket(2)`: new sockets get an [`FdContext`].
///
/// # Safety
/// Plain libc contract.
pub unsafe fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (sys::originals().socket)(domain, ty, protocol);
    if local::hook_enabled() && fd != -1 {
        FdManager::global().get(fd, true);
    }
    fd
}

/// `connect(2)` that parks the fiber for at most `timeout_ms` (forever when
/// `None`) while the connection is in progress.
///
/// # Safety
/// `addr` must point to `addrlen` valid bytes.
pub unsafe fn connect_with_timeout(fd: c_int, addr: *const sockaddr, addrlen: socklen_t, timeout_ms: Option<u64>) -> c_int {
    let originals = sys::originals();
    let _ctx = match managed_socket(fd) {
        Ok(ctx) => ctx,
        Err(Some(errno)) => {
            set_errno(errno);
            return -1;
        }
        Err(None) => return (originals.connect)(fd, addr, addrlen),
    };

    let n = (originals.connect)(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }
    let Some(iom) = IoManager::current() else {
        return n;
    };
    if Fiber::current_task_fiber().is_none() {
        return n;
    }

    if let Err(errno) = park_on(&iom, fd, Event::WRITE, timeout_ms) {
        set_errno(errno);
        return -1;
    }

    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if (originals.getsockopt)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        (&mut error as *mut c_int).cast(),
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// Hooked `connect(2)` using the configured TCP connect timeout.
///
/// # Safety
/// `addr` must point to `addrlen` valid bytes.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    let timeout = match config::current().tcp_connect_timeout_ms {
        u64::MAX => None,
        ms => Some(ms),
    };
    connect_with_timeout(fd, addr, addrlen, timeout)
}

/// Hooked `accept(2)`: accepted sockets get an [`FdContext`].
///
/// # Safety
/// Plain libc contract.
pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    let accept = sys::originals().accept;
    let client = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || accept(fd, addr, addrlen) as ssize_t) as c_int;
    if client >= 0 {
        FdManager::global().get(client, true);
    }
    client
}

/// Hooked `read(2)`.
///
/// # Safety
/// `buf` must be valid for `count` bytes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    let read = sys::originals().read;
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || read(fd, buf, count))
}

/// Hooked `readv(2)`.
///
/// # Safety
/// `iov` must describe `iovcnt` valid buffers.
pub unsafe fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let readv = sys::originals().readv;
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || readv(fd, iov, iovcnt))
}

/// Hooked `recv(2)`.
///
/// # Safety
/// `buf` must be valid for `len` bytes.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    let recv = sys::originals().recv;
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || recv(fd, buf, len, flags))
}

/// Hooked `recvfrom(2)`.
///
/// # Safety
/// Plain libc contract.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    let recvfrom = sys::originals().recvfrom;
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || {
        recvfrom(fd, buf, len, flags, src, addrlen)
    })
}

/// Hooked `recvmsg(2)`.
///
/// # Safety
/// `msg` must be a valid message header.
pub unsafe fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    let recvmsg = sys::originals().recvmsg;
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || recvmsg(fd, msg, flags))
}

/// Hooked `write(2)`.
///
/// # Safety
/// `buf` must be valid for `count` bytes.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    let write = sys::originals().write;
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || write(fd, buf, count))
}

/// Hooked `writev(2)`.
///
/// # Safety
/// `iov` must describe `iovcnt` valid buffers.
pub unsafe fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    let writev = sys::originals().writev;
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || writev(fd, iov, iovcnt))
}

/// Hooked `send(2)`.
///
/// # Safety
/// `buf` must be valid for `len` bytes.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    let send = sys::originals().send;
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || send(fd, buf, len, flags))
}

/// Hooked `sendto(2)`.
///
/// # Safety
/// Plain libc contract.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    let sendto = sys::originals().sendto;
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || {
        sendto(fd, buf, len, flags, dest, addrlen)
    })
}

/// Hooked `sendmsg(2)`.
///
/// # Safety
/// `msg` must be a valid message header.
pub unsafe fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    let sendmsg = sys::originals().sendmsg;
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || sendmsg(fd, msg, flags))
}

/// Hooked `close(2)`: wakes every fiber waiting on `fd` and drops its context.
///
/// # Safety
/// Plain libc contract.
pub unsafe fn close(fd: c_int) -> c_int {
    // Mark the context closed before waking anyone, so a woken waiter on
    // another worker cannot retry and park on the dying descriptor.
    if local::hook_enabled() && FdManager::global().get(fd, false).is_some() {
        FdManager::global().del(fd);
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
    }
    (sys::originals().close)(fd)
}

/// Socket context that the non-blocking virtualisation applies to.
fn nonblock_context(fd: RawFd) -> Option<Arc<FdContext>> {
    FdManager::global()
        .get(fd, false)
        .filter(|ctx| !ctx.is_closed() && ctx.is_socket())
}

/// Hooked `fcntl(2)`.
///
/// For managed sockets `F_SETFL` records the user's `O_NONBLOCK` choice while
/// the descriptor stays non-blocking underneath, and `F_GETFL` reports the
/// user's view.
///
/// # Safety
/// `arg` is interpreted according to `cmd` as by libc.
pub unsafe fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    let original = sys::originals().fcntl;
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            let Some(ctx) = nonblock_context(fd) else {
                return original(fd, cmd, flags);
            };
            ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            } else {
                flags &= !libc::O_NONBLOCK;
            }
            original(fd, cmd, flags)
        }
        libc::F_GETFL => {
            let flags = original(fd, cmd);
            if flags == -1 {
                return flags;
            }
            match nonblock_context(fd) {
                Some(ctx) if ctx.user_nonblock() => flags | libc::O_NONBLOCK,
                Some(_) => flags & !libc::O_NONBLOCK,
                None => flags,
            }
        }
        _ => original(fd, cmd, arg),
    }
}

/// Hooked `ioctl(2)`; `FIONBIO` records the user's non-blocking choice.
///
/// # Safety
/// `arg` is interpreted according to `request` as by libc.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let user_nonblock = *(arg as *const c_int) != 0;
        if let Some(ctx) = nonblock_context(fd) {
            ctx.set_user_nonblock(user_nonblock);
        }
    }
    (sys::originals().ioctl)(fd, request, arg)
}

/// Hooked `getsockopt(2)` (passes through).
///
/// # Safety
/// Plain libc contract.
pub unsafe fn getsockopt(fd: c_int, level: c_int, name: c_int, value: *mut c_void, len: *mut socklen_t) -> c_int {
    (sys::originals().getsockopt)(fd, level, name, value, len)
}

/// Hooked `setsockopt(2)`; `SO_RCVTIMEO` / `SO_SNDTIMEO` also set the
/// timeout used while parked.
///
/// # Safety
/// `value` must point to `len` valid bytes.
pub unsafe fn setsockopt(fd: c_int, level: c_int, name: c_int, value: *const c_void, len: socklen_t) -> c_int {
    if local::hook_enabled()
        && level == libc::SOL_SOCKET
        && (name == libc::SO_RCVTIMEO || name == libc::SO_SNDTIMEO)
        && !value.is_null()
        && len as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = FdManager::global().get(fd, false) {
            let tv = &*(value as *const libc::timeval);
            let ms = duration_ms(tv.tv_sec as i64, tv.tv_usec as i64 / 1000);
            let kind = if name == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            // A zero timeval means "no timeout".
            ctx.set_timeout_ms(kind, (ms > 0).then_some(ms));
        }
    }
    (sys::originals().setsockopt)(fd, level, name, value, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_flag_is_thread_local() {
        set_hook_enabled(true);
        assert!(is_hook_enabled());
        std::thread::spawn(|| assert!(!is_hook_enabled())).join().unwrap();
        set_hook_enabled(false);
        assert!(!is_hook_enabled());
    }

    #[test]
    fn test_disabled_hook_passes_through() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let msg = b"hi";
        let n = unsafe { write(fds[1], msg.as_ptr().cast(), msg.len()) };
        assert_eq!(n, 2);
        let mut buf = [0u8; 4];
        let n = unsafe { read(fds[0], buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], msg);
        unsafe {
            close(fds[0]);
            close(fds[1]);
        }
    }

    #[test]
    fn test_fcntl_virtualises_nonblock() {
        let mut fds = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let ctx = FdManager::global().get(fds[0], true).unwrap();
        assert!(ctx.sys_nonblock());

        // The user sees a blocking socket although it is non-blocking underneath.
        let flags = unsafe { fcntl(fds[0], libc::F_GETFL, 0) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        let real = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_ne!(real & libc::O_NONBLOCK, 0);

        unsafe { fcntl(fds[0], libc::F_SETFL, (flags | libc::O_NONBLOCK) as c_ulong) };
        assert!(ctx.user_nonblock());
        let flags = unsafe { fcntl(fds[0], libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        unsafe { fcntl(fds[0], libc::F_SETFL, (flags & !libc::O_NONBLOCK) as c_ulong) };
        assert!(!ctx.user_nonblock());
        let real = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        assert_ne!(real & libc::O_NONBLOCK, 0);

        FdManager::global().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_ioctl_fionbio_records_choice() {
        let mut fds = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let ctx = FdManager::global().get(fds[0], true).unwrap();
        let mut on: c_int = 1;
        assert_eq!(
            unsafe { ioctl(fds[0], libc::FIONBIO as c_ulong, (&mut on as *mut c_int).cast()) },
            0
        );
        assert!(ctx.user_nonblock());
        FdManager::global().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_setsockopt_records_timeout() {
        set_hook_enabled(true);
        let fd = unsafe { socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        let rc = unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                (&tv as *const libc::timeval).cast(),
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        assert_eq!(rc, 0);
        let ctx = FdManager::global().get(fd, false).unwrap();
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), Some(1500));
        assert_eq!(ctx.timeout_ms(TimeoutKind::Send), None);
        unsafe { close(fd) };
        assert!(FdManager::global().get(fd, false).is_none());
        set_hook_enabled(false);
    }

    #[test]
    fn test_duration_ms_clamps_and_saturates() {
        assert_eq!(duration_ms(1, 500), 1500);
        assert_eq!(duration_ms(-5, -1), 0);
        assert_eq!(duration_ms(i64::MAX, 999), u64::MAX);
        assert_eq!(duration_ms(0, 250), 250);
    }

    #[test]
    fn test_setsockopt_huge_timeout_saturates() {
        set_hook_enabled(true);
        let fd = unsafe { socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let tv = libc::timeval {
            tv_sec: libc::time_t::MAX,
            tv_usec: 0,
        };
        let _ = unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDTIMEO,
                (&tv as *const libc::timeval).cast(),
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        let ctx = FdManager::global().get(fd, false).unwrap();
        assert_eq!(ctx.timeout_ms(TimeoutKind::Send), None);
        unsafe { close(fd) };
        set_hook_enabled(false);
    }

    #[test]
    fn test_close_marks_context_before_release() {
        set_hook_enabled(true);
        let fd = unsafe { socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        let ctx = FdManager::global().get(fd, false).unwrap();
        assert!(!ctx.is_closed());
        assert_eq!(unsafe { close(fd) }, 0);
        assert!(ctx.is_closed());
        set_hook_enabled(false);
    }

    #[test]
    fn test_sleep_without_fiber_falls_back() {
        set_hook_enabled(true);
        let start = std::time::Instant::now();
        assert_eq!(usleep(20_000), 0);
        assert!(start.elapsed() >= std::time::Duration::from_millis(15));
        set_hook_enabled(false);
    }
}
