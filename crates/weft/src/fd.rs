//! Per-descriptor metadata for the hook layer
//!
//! [`FdManager`] keeps one [`FdContext`] per descriptor the hook layer has
//! seen. The context remembers whether the descriptor is a socket, whether
//! the *user* asked for non-blocking mode (as opposed to the runtime forcing
//! it), and the per-direction timeouts set through `setsockopt`.

use crate::hook::sys;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// No timeout configured
const NO_TIMEOUT: u64 = u64::MAX;

/// Which socket timeout applies to an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`, used by the read family
    Recv,
    /// `SO_SNDTIMEO`, used by the write family and `connect`
    Send,
}

/// Hook metadata of one descriptor
#[derive(Debug)]
pub struct FdContext {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdContext {
    /// Inspect `fd`. Sockets are switched to `O_NONBLOCK` at the system level.
    fn new(fd: RawFd) -> Self {
        // SAFETY: fstat only writes into the provided buffer.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let (is_init, is_socket) = if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            (false, false)
        } else {
            (true, stat.st_mode & libc::S_IFMT == libc::S_IFSOCK)
        };

        let mut sys_nonblock = false;
        if is_socket {
            let originals = sys::originals();
            // SAFETY: plain fcntl on a descriptor we just inspected.
            unsafe {
                let flags = (originals.fcntl)(fd, libc::F_GETFL, 0);
                if flags != -1 && flags & libc::O_NONBLOCK == 0 {
                    (originals.fcntl)(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            sys_nonblock = true;
        }

        Self {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    /// Descriptor number
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// `fstat` succeeded when the context was created.
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    /// Whether the descriptor is a socket.
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// Whether the descriptor has been closed through the hook layer.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Non-blocking mode as the user requested it.
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    /// Record the user's non-blocking choice.
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    /// Non-blocking mode at the system level.
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    /// Record the system-level non-blocking mode.
    pub fn set_sys_nonblock(&self, on: bool) {
        self.sys_nonblock.store(on, Ordering::Release);
    }

    fn timeout_slot(&self, kind: TimeoutKind) -> &AtomicU64 {
        match kind {
            TimeoutKind::Recv => &self.recv_timeout_ms,
            TimeoutKind::Send => &self.send_timeout_ms,
        }
    }

    /// Timeout in milliseconds, `None` when operations may wait forever.
    pub fn timeout_ms(&self, kind: TimeoutKind) -> Option<u64> {
        match self.timeout_slot(kind).load(Ordering::Acquire) {
            NO_TIMEOUT => None,
            ms => Some(ms),
        }
    }

    /// Set or clear a timeout.
    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: Option<u64>) {
        self.timeout_slot(kind).store(ms.unwrap_or(NO_TIMEOUT), Ordering::Release);
    }
}

/// Table of [`FdContext`]s indexed by descriptor
pub struct FdManager {
    contexts: RwLock<Vec<Option<Arc<FdContext>>>>,
}

static GLOBAL: Lazy<FdManager> = Lazy::new(|| FdManager::with_capacity(64));

impl FdManager {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            contexts: RwLock::new(vec![None; capacity]),
        }
    }

    /// The process-wide table.
    pub fn global() -> &'static FdManager {
        &GLOBAL
    }

    /// Context of `fd`, creating it when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let contexts = self.contexts.read();
            match contexts.get(idx) {
                Some(Some(ctx)) => return Some(Arc::clone(ctx)),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut contexts = self.contexts.write();
        if idx >= contexts.len() {
            let new_len = (idx * 3 / 2).max(idx + 1);
            contexts.resize(new_len, None);
        }
        if let Some(ctx) = &contexts[idx] {
            return Some(Arc::clone(ctx));
        }
        let ctx = Arc::new(FdContext::new(fd));
        contexts[idx] = Some(Arc::clone(&ctx));
        Some(ctx)
    }

    /// Forget `fd`.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let removed = {
            let mut contexts = self.contexts.write();
            contexts.get_mut(fd as usize).and_then(Option::take)
        };
        if let Some(ctx) = removed {
            ctx.set_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socketpair() -> [RawFd; 2] {
        let mut fds = [0; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        fds
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_socket_is_forced_nonblocking() {
        let [a, b] = socketpair();
        let manager = FdManager::with_capacity(4);
        let ctx = manager.get(a, true).unwrap();
        assert!(ctx.is_init());
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        let flags = unsafe { libc::fcntl(a, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        close(a);
        close(b);
    }

    #[test]
    fn test_regular_file_is_not_socket() {
        let file = tempfile::tempfile().unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
        let manager = FdManager::with_capacity(4);
        let ctx = manager.get(fd, true).unwrap();
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
    }

    #[test]
    fn test_get_without_create() {
        let manager = FdManager::with_capacity(4);
        assert!(manager.get(3, false).is_none());
        assert!(manager.get(-1, true).is_none());
    }

    #[test]
    fn test_table_grows_and_del() {
        let [a, b] = socketpair();
        let manager = FdManager::with_capacity(1);
        let ctx = manager.get(b, true).unwrap();
        assert!(manager.contexts.read().len() > b as usize);
        assert!(Arc::ptr_eq(&ctx, &manager.get(b, false).unwrap()));
        manager.del(b);
        assert!(ctx.is_closed());
        assert!(manager.get(b, false).is_none());
        close(a);
        close(b);
    }

    #[test]
    fn test_timeouts() {
        let [a, b] = socketpair();
        let manager = FdManager::with_capacity(4);
        let ctx = manager.get(a, true).unwrap();
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), None);
        ctx.set_timeout_ms(TimeoutKind::Recv, Some(250));
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), Some(250));
        assert_eq!(ctx.timeout_ms(TimeoutKind::Send), None);
        ctx.set_timeout_ms(TimeoutKind::Recv, None);
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), None);
        close(a);
        close(b);
    }
}
