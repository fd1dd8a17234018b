//! Saved CPU context and the switch between two of them
//!
//! This is the only place that knows how a context is captured and resumed.
//! It is backed by glibc's `ucontext` family on every Linux target.

use super::stack::Stack;
use std::mem::MaybeUninit;

extern "C" {
    fn getcontext(ucp: *mut libc::ucontext_t) -> libc::c_int;
    fn makecontext(ucp: *mut libc::ucontext_t, func: extern "C" fn(), argc: libc::c_int, ...);
    fn swapcontext(oucp: *mut libc::ucontext_t, ucp: *const libc::ucontext_t) -> libc::c_int;
}

/// Saved register set of a suspended execution context
pub(crate) struct Context {
    /// Boxed so the address handed to the C library never moves
    uc: Box<libc::ucontext_t>,
}

impl Context {
    /// Context for the stack the caller is already running on.
    pub(crate) fn capture() -> Self {
        // SAFETY: ucontext_t is plain data; getcontext fills it in.
        let mut uc: Box<libc::ucontext_t> =
            Box::new(unsafe { MaybeUninit::zeroed().assume_init() });
        if unsafe { getcontext(&mut *uc) } != 0 {
            fatal!("getcontext failed: {}", std::io::Error::last_os_error());
        }
        Self { uc }
    }

    /// Context that starts `entry` on a fresh frame at the top of `stack`.
    pub(crate) fn with_stack(stack: &Stack, entry: extern "C" fn()) -> Self {
        let mut ctx = Self::capture();
        ctx.prepare(stack, entry);
        ctx
    }

    /// Rebuild this context over `stack`, discarding whatever it held.
    pub(crate) fn prepare(&mut self, stack: &Stack, entry: extern "C" fn()) {
        if unsafe { getcontext(&mut *self.uc) } != 0 {
            fatal!("getcontext failed: {}", std::io::Error::last_os_error());
        }
        self.uc.uc_link = std::ptr::null_mut();
        self.uc.uc_stack.ss_sp = stack.bottom() as *mut libc::c_void;
        self.uc.uc_stack.ss_size = stack.len();
        self.uc.uc_stack.ss_flags = 0;
        // SAFETY: the context and stack are valid; entry takes no arguments.
        unsafe { makecontext(&mut *self.uc, entry, 0) };
    }

    /// Save the running context into `from` and resume `to`.
    ///
    /// # Safety
    /// Both pointers must be valid for the duration of the switch, `to` must
    /// hold a context that is not executing on any thread, and `from` must be
    /// the context of the code calling this function.
    pub(crate) unsafe fn switch(from: *mut Context, to: *const Context) {
        let from_uc: *mut libc::ucontext_t = &mut *(*from).uc;
        let to_uc: *const libc::ucontext_t = &*(*to).uc;
        if swapcontext(from_uc, to_uc) != 0 {
            fatal!("swapcontext failed: {}", std::io::Error::last_os_error());
        }
    }
}
