//! Table of the original libc entry points
//!
//! Everything inside the runtime that must bypass the hooks (the reactor's
//! tickle pipe, descriptor inspection, the fallback path of every hook) goes
//! through [`originals`]. With the `interpose` feature the hooks shadow the
//! libc symbols, so the table is filled with `dlsym(RTLD_NEXT, ..)`;
//! otherwise it points straight at libc.

use libc::{c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, useconds_t};
use once_cell::sync::Lazy;

pub(crate) struct Originals {
    pub sleep: unsafe extern "C" fn(c_uint) -> c_uint,
    pub usleep: unsafe extern "C" fn(useconds_t) -> c_int,
    pub nanosleep: unsafe extern "C" fn(*const timespec, *mut timespec) -> c_int,
    pub socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    pub connect: unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int,
    pub accept: unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int,
    pub read: unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t,
    pub readv: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t,
    pub recv: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t,
    pub recvfrom: unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int, *mut sockaddr, *mut socklen_t) -> ssize_t,
    pub recvmsg: unsafe extern "C" fn(c_int, *mut msghdr, c_int) -> ssize_t,
    pub write: unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t,
    pub writev: unsafe extern "C" fn(c_int, *const iovec, c_int) -> ssize_t,
    pub send: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t,
    pub sendto: unsafe extern "C" fn(c_int, *const c_void, size_t, c_int, *const sockaddr, socklen_t) -> ssize_t,
    pub sendmsg: unsafe extern "C" fn(c_int, *const msghdr, c_int) -> ssize_t,
    pub close: unsafe extern "C" fn(c_int) -> c_int,
    pub fcntl: unsafe extern "C" fn(c_int, c_int, ...) -> c_int,
    pub ioctl: unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int,
    pub getsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *mut c_void, *mut socklen_t) -> c_int,
    pub setsockopt: unsafe extern "C" fn(c_int, c_int, c_int, *const c_void, socklen_t) -> c_int,
}

#[cfg(not(feature = "interpose"))]
fn load() -> Originals {
    Originals {
        sleep: libc::sleep,
        usleep: libc::usleep,
        nanosleep: libc::nanosleep,
        socket: libc::socket,
        connect: libc::connect,
        accept: libc::accept,
        read: libc::read,
        readv: libc::readv,
        recv: libc::recv,
        recvfrom: libc::recvfrom,
        recvmsg: libc::recvmsg,
        write: libc::write,
        writev: libc::writev,
        send: libc::send,
        sendto: libc::sendto,
        sendmsg: libc::sendmsg,
        close: libc::close,
        fcntl: libc::fcntl,
        ioctl: libc::ioctl,
        getsockopt: libc::getsockopt,
        setsockopt: libc::setsockopt,
    }
}

#[cfg(feature = "interpose")]
fn load() -> Originals {
    use std::ffi::CStr;

    /// Next definition of `name` after this object in lookup order.
    ///
    /// # Safety
    /// `T` must be the function pointer type of the symbol.
    unsafe fn next<T: Copy>(name: &CStr) -> T {
        assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<*mut c_void>());
        let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
        if sym.is_null() {
            fatal!("dlsym(RTLD_NEXT, {:?}) found nothing", name);
        }
        std::mem::transmute_copy(&sym)
    }

    // SAFETY: each symbol is looked up with its libc prototype.
    unsafe {
        Originals {
            sleep: next(c"sleep"),
            usleep: next(c"usleep"),
            nanosleep: next(c"nanosleep"),
            socket: next(c"socket"),
            connect: next(c"connect"),
            accept: next(c"accept"),
            read: next(c"read"),
            readv: next(c"readv"),
            recv: next(c"recv"),
            recvfrom: next(c"recvfrom"),
            recvmsg: next(c"recvmsg"),
            write: next(c"write"),
            writev: next(c"writev"),
            send: next(c"send"),
            sendto: next(c"sendto"),
            sendmsg: next(c"sendmsg"),
            close: next(c"close"),
            fcntl: next(c"fcntl"),
            ioctl: next(c"ioctl"),
            getsockopt: next(c"getsockopt"),
            setsockopt: next(c"setsockopt"),
        }
    }
}

static ORIGINALS: Lazy<Originals> = Lazy::new(load);

/// The original libc functions.
pub(crate) fn originals() -> &'static Originals {
    &ORIGINALS
}
