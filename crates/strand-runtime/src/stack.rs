//! Coroutine stacks
//!
//! Each coroutine owns a private mmap'd region with a PROT_NONE guard
//! page at the low end, so a stack overflow faults instead of silently
//! corrupting a neighbour.

use std::io;
use std::ptr::NonNull;

fn page_size() -> usize {
    // SAFETY: sysconf is always callable; _SC_PAGESIZE never fails.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned, fixed-size coroutine stack.
pub struct Stack {
    base: NonNull<u8>,
    /// Total mapping length, guard page included.
    len: usize,
    guard: usize,
}

// SAFETY: the mapping is private to this Stack; &Stack only exposes
// the raw top pointer, and the bytes are only touched by the coroutine
// that owns the stack while it executes.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack of at least `size` usable bytes (rounded up to whole
    /// pages) with one guard page below it.
    pub fn new(size: usize) -> io::Result<Stack> {
        let page = page_size();
        let usable = size.div_ceil(page) * page;
        let total = usable + page;

        // SAFETY: anonymous private mapping, checked for MAP_FAILED.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Guard page at the low end; stacks grow down into it on overflow.
        // SAFETY: base..base+page is inside the mapping we just created.
        let rt = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rt != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: unmapping the mapping we just created.
            unsafe { libc::munmap(base, total) };
            return Err(err);
        }

        Ok(Stack {
            base: NonNull::new(base as *mut u8).expect("mmap returned null"),
            len: total,
            guard: page,
        })
    }

    /// High end of the stack; the initial stack pointer starts here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        // SAFETY: base + len is one past the end of the mapping, a valid
        // provenance-carrying pointer.
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Usable bytes (mapping minus guard page).
    #[inline]
    pub fn usable(&self) -> usize {
        self.len - self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the region mapped in `new`.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_top() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert!(stack.usable() >= 64 * 1024);
        assert!(!stack.top().is_null());
        assert_eq!(stack.top() as usize % 8, 0);
    }

    #[test]
    fn test_rounds_up_to_page() {
        let stack = Stack::new(1).unwrap();
        assert!(stack.usable() >= 1);
        assert_eq!(stack.usable() % 4096, 0);
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = Stack::new(16 * 1024).unwrap();
        // Touch the highest usable bytes.
        unsafe {
            let p = stack.top().sub(8);
            std::ptr::write_volatile(p as *mut u64, 0xDEAD_BEEF);
            assert_eq!(std::ptr::read_volatile(p as *const u64), 0xDEAD_BEEF);
        }
    }
}
