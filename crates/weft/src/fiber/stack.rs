//! Fiber stacks
//!
//! Each stack is an anonymous private mapping with one inaccessible guard page
//! below the usable region, so an overflow faults instead of silently
//! corrupting a neighbouring allocation.

use std::io;
use std::ptr::NonNull;

/// An owned, fixed-size fiber stack
pub(crate) struct Stack {
    /// Start of the mapping (the guard page)
    base: NonNull<u8>,
    /// Total mapping length including the guard page
    mapped: usize,
    /// Page size the mapping was built with
    page: usize,
}

// SAFETY: the mapping is owned exclusively by this value.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes.
    pub(crate) fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let usable = size.max(page).div_ceil(page) * page;
        let mapped = usable + page;

        // SAFETY: anonymous mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: the first page belongs to the mapping created above.
        if unsafe { libc::mprotect(ptr, page, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(ptr, mapped) };
            return Err(err);
        }

        Ok(Self {
            base: NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?,
            mapped,
            page,
        })
    }

    /// Lowest usable address (just above the guard page).
    pub(crate) fn bottom(&self) -> *mut u8 {
        // SAFETY: stays inside the mapping.
        unsafe { self.base.as_ptr().add(self.page) }
    }

    /// Usable size in bytes.
    pub(crate) fn len(&self) -> usize {
        self.mapped - self.page
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly what `new` mapped.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.mapped);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}
