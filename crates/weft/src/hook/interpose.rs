//! Process-wide interposition of the hooked libc symbols
//!
//! Linking this module defines `read`, `write`, `connect` and the rest with C
//! linkage, so calls made anywhere in the process (including from C
//! libraries) reach the hook layer first. The hooks fall through to the
//! `dlsym(RTLD_NEXT, ..)` originals whenever hooking is disabled for the
//! calling thread.
//!
//! `fcntl` and `ioctl` are variadic in C. They are defined here with one
//! fixed word-sized argument, which every caller passes in the same register
//! on the supported ABIs.

#![allow(missing_docs, clippy::missing_safety_doc)]

use libc::{c_int, c_uint, c_ulong, c_void, iovec, msghdr, size_t, sockaddr, socklen_t, ssize_t, timespec, useconds_t};

#[no_mangle]
pub extern "C" fn sleep(seconds: c_uint) -> c_uint {
    super::sleep(seconds)
}

#[no_mangle]
pub extern "C" fn usleep(usec: useconds_t) -> c_int {
    super::usleep(usec)
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const timespec, rem: *mut timespec) -> c_int {
    super::nanosleep(req, rem)
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    super::socket(domain, ty, protocol)
}

#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
    super::connect(fd, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn accept(fd: c_int, addr: *mut sockaddr, addrlen: *mut socklen_t) -> c_int {
    super::accept(fd, addr, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    super::read(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    super::readv(fd, iov, iovcnt)
}

#[no_mangle]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    super::recv(fd, buf, len, flags)
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    super::recvfrom(fd, buf, len, flags, src, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(fd: c_int, msg: *mut msghdr, flags: c_int) -> ssize_t {
    super::recvmsg(fd, msg, flags)
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    super::write(fd, buf, count)
}

#[no_mangle]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const iovec, iovcnt: c_int) -> ssize_t {
    super::writev(fd, iov, iovcnt)
}

#[no_mangle]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    super::send(fd, buf, len, flags)
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest: *const sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    super::sendto(fd, buf, len, flags, dest, addrlen)
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(fd: c_int, msg: *const msghdr, flags: c_int) -> ssize_t {
    super::sendmsg(fd, msg, flags)
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    super::close(fd)
}

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_ulong) -> c_int {
    super::fcntl(fd, cmd, arg)
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    super::ioctl(fd, request, arg)
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    value: *mut c_void,
    len: *mut socklen_t,
) -> c_int {
    super::getsockopt(fd, level, name, value, len)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: c_int,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> c_int {
    super::setsockopt(fd, level, name, value, len)
}
