//! Page-backed LIFO storage for expected return addresses.
//!
//! The stack lives in its own anonymous mapping rather than on the heap so
//! the guarded variant can seal it `PROT_READ` between mutations: a stray
//! write primitive elsewhere in the process cannot silently rewrite the
//! addresses the validator is about to trust.

use std::io;
use std::ptr;

use log::debug;

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An anonymous private mapping sized in whole pages.
struct Mapping {
    ptr: *mut usize,
    bytes: usize,
}

impl Mapping {
    fn allocate(bytes: usize) -> io::Result<Mapping> {
        debug_assert_eq!(bytes % page_size(), 0);
        // SAFETY: fresh anonymous mapping, no fd involved.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Mapping {
            ptr: ptr as *mut usize,
            bytes,
        })
    }

    fn protect(&self, prot: libc::c_int) -> io::Result<()> {
        // SAFETY: the range is exactly the mapping we own.
        if unsafe { libc::mprotect(self.ptr as *mut libc::c_void, self.bytes, prot) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.bytes / std::mem::size_of::<usize>()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: unmapping the region we mapped; failure leaks, nothing worse.
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.bytes) };
    }
}

/// A growable LIFO of pointer-width values in page-aligned storage.
///
/// With `PROTECT = true` the backing pages are readable but not writable
/// except inside [`push`](PageStack::push), which briefly opens a write
/// window, grows the mapping if full, stores the value, and seals the pages
/// again before returning. `pop` and `top` never change protection; reads
/// stay legal throughout.
///
/// Capacity is always a whole number of pages and doubles on growth, so the
/// amortized cost of the copy stays constant. One stack is owned by exactly
/// one execution context; the protection toggle is not safe for concurrent
/// mutation of the same stack.
pub struct PageStack<const PROTECT: bool> {
    data: Mapping,
    len: usize,
}

/// Variant that leaves its pages writable (one `mprotect` pair per push is
/// too expensive for some deployments).
pub type PlainStack = PageStack<false>;

/// Variant that seals its pages read-only between pushes.
pub type GuardedStack = PageStack<true>;

// SAFETY: the raw pointer is to a mapping owned exclusively by this value;
// moving it to another thread moves ownership with it.
unsafe impl<const PROTECT: bool> Send for PageStack<PROTECT> {}

impl<const PROTECT: bool> PageStack<PROTECT> {
    pub fn new() -> io::Result<Self> {
        let stack = PageStack {
            data: Mapping::allocate(page_size())?,
            len: 0,
        };
        stack.seal()?;
        Ok(stack)
    }

    fn seal(&self) -> io::Result<()> {
        if PROTECT {
            self.data.protect(libc::PROT_READ)
        } else {
            Ok(())
        }
    }

    fn unseal(&self) -> io::Result<()> {
        if PROTECT {
            self.data.protect(libc::PROT_READ | libc::PROT_WRITE)
        } else {
            Ok(())
        }
    }

    /// Push a value, growing the mapping if it is full.
    ///
    /// Growth reuses the same write window as the store itself: the pages are
    /// sealed again by the time this returns.
    pub fn push(&mut self, value: usize) -> io::Result<()> {
        self.unseal()?;
        if self.len == self.data.capacity() {
            let grown = Mapping::allocate(self.data.bytes * 2)?;
            // SAFETY: disjoint regions; the old one holds `len` initialized
            // values and stays readable.
            unsafe { ptr::copy_nonoverlapping(self.data.ptr, grown.ptr, self.len) };
            debug!("shadow stack grew to {} bytes", grown.bytes);
            self.data = grown;
        }
        // SAFETY: len < capacity after the growth check.
        unsafe { self.data.ptr.add(self.len).write(value) };
        self.len += 1;
        self.seal()
    }

    /// Drop the top value. Requires a non-empty stack.
    pub fn pop(&mut self) {
        debug_assert!(self.len > 0, "pop on an empty stack");
        self.len -= 1;
    }

    /// The most recently pushed value. Callers must check
    /// [`is_empty`](PageStack::is_empty) first.
    pub fn top(&self) -> usize {
        debug_assert!(self.len > 0, "top on an empty stack");
        // SAFETY: indices below len are initialized and the pages are
        // always at least PROT_READ.
        unsafe { self.data.ptr.add(self.len - 1).read() }
    }

    /// Forget every entry without touching page protections.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifo_contract<const P: bool>() {
        let mut stack = PageStack::<P>::new().expect("mmap");
        assert!(stack.is_empty());

        stack.push(0x10).unwrap();
        stack.push(0x20).unwrap();
        assert_eq!(stack.top(), 0x20);
        stack.pop();
        assert_eq!(stack.top(), 0x10);
        stack.pop();
        assert!(stack.is_empty());
    }

    #[test]
    fn plain_stack_is_lifo() {
        lifo_contract::<false>();
    }

    #[test]
    fn guarded_stack_is_lifo() {
        lifo_contract::<true>();
    }

    fn growth_preserves_contents<const P: bool>() {
        let mut stack = PageStack::<P>::new().expect("mmap");
        let initial = stack.capacity();

        for v in 0..=initial {
            stack.push(v).unwrap();
        }
        assert_eq!(stack.capacity(), initial * 2);
        assert_eq!(stack.len(), initial + 1);

        for v in (0..=initial).rev() {
            assert_eq!(stack.top(), v);
            stack.pop();
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn plain_stack_doubles_once_when_full() {
        growth_preserves_contents::<false>();
    }

    #[test]
    fn guarded_stack_doubles_once_when_full() {
        growth_preserves_contents::<true>();
    }

    #[test]
    fn capacity_is_page_aligned() {
        let stack = PlainStack::new().expect("mmap");
        let bytes = stack.capacity() * std::mem::size_of::<usize>();
        assert_eq!(bytes % page_size(), 0);
        assert!(bytes >= page_size());
    }

    #[test]
    fn clear_empties_without_reallocating() {
        let mut stack = GuardedStack::new().expect("mmap");
        for v in 0..16 {
            stack.push(v).unwrap();
        }
        let cap = stack.capacity();
        stack.clear();
        assert!(stack.is_empty());
        assert_eq!(stack.capacity(), cap);

        // Still usable after a clear.
        stack.push(0x99).unwrap();
        assert_eq!(stack.top(), 0x99);
    }
}
