//! `mmap`-backed coroutine stacks with a guard page.
//!
//! The switching layer and the scheduler above it never allocate stacks;
//! callers do. This module is the convenience most callers want: an
//! anonymous private mapping with one no-access page at the low end, so a
//! stack overflow faults instead of silently corrupting whatever happens to
//! sit below.
//!
//! A stack can be torn apart with [`StackMem::into_raw`] and rebuilt with
//! [`StackMem::from_raw`], which is how a cleanup callback running long after
//! the original owner is gone gets to release the memory.

use std::io;
use thiserror::Error;

/// Default usable stack size when the caller has no opinion: 128 KiB, or the
/// `WEFT_STACK_SIZE` environment variable (bytes) if set.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Errors from mapping stack memory.
#[derive(Debug, Error)]
pub enum StackError {
    /// `mmap` refused the allocation.
    #[error("mmap failed: {0}")]
    Map(io::Error),

    /// The guard page could not be protected.
    #[error("mprotect failed: {0}")]
    Protect(io::Error),
}

/// The default stack size, honoring the `WEFT_STACK_SIZE` override.
pub fn default_stack_size() -> usize {
    std::env::var("WEFT_STACK_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_STACK_SIZE)
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// An owned coroutine stack: one guard page followed by `size` usable bytes.
///
/// Stacks grow downward on the supported targets, so the guard page sits at
/// the low end of the mapping and the usable region starts at
/// [`StackMem::bottom`].
pub struct StackMem {
    base: *mut u8,
    size: usize,
}

// SAFETY: the mapping is exclusively owned and only ever touched by one
// thread at a time; moving ownership across threads is what coroutine
// migration does.
unsafe impl Send for StackMem {}

impl StackMem {
    /// Map a stack with `size` usable bytes (rounded up to a whole number of
    /// pages) and a guard page below them.
    pub fn map(size: usize) -> Result<StackMem, StackError> {
        let page = page_size();
        let size = (size + page - 1) & !(page - 1);
        let total = size + page;

        // SAFETY: anonymous private mapping, no file, standard arguments.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::Map(io::Error::last_os_error()));
        }

        // SAFETY: `base` is a live mapping and the guard page is within it.
        let rc = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: matches the mmap above.
            unsafe { libc::munmap(base, total) };
            return Err(StackError::Protect(err));
        }

        Ok(StackMem {
            base: base.cast(),
            size,
        })
    }

    /// Map a stack of [`default_stack_size`] bytes.
    pub fn map_default() -> Result<StackMem, StackError> {
        Self::map(default_stack_size())
    }

    /// Low end of the usable region (just above the guard page).
    pub fn bottom(&self) -> *mut u8 {
        // SAFETY: the guard page is part of the same mapping.
        unsafe { self.base.add(page_size()) }
    }

    /// Usable size in bytes, excluding the guard page.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Give up ownership, returning `(bottom, size)` as handed to a
    /// coroutine descriptor. The mapping stays live until a matching
    /// [`StackMem::from_raw`] is dropped.
    pub fn into_raw(self) -> (*mut u8, usize) {
        let out = (self.bottom(), self.size);
        std::mem::forget(self);
        out
    }

    /// Rebuild a stack from the `(bottom, size)` pair produced by
    /// [`StackMem::into_raw`].
    ///
    /// # Safety
    ///
    /// `bottom` and `size` must come from `into_raw` in this process, the
    /// mapping must still be live, and no context may still be running on it.
    pub unsafe fn from_raw(bottom: *mut u8, size: usize) -> StackMem {
        StackMem {
            base: bottom.sub(page_size()),
            size,
        }
    }
}

impl Drop for StackMem {
    fn drop(&mut self) {
        let total = self.size + page_size();
        // SAFETY: `base`/`total` describe the mapping created in `map`.
        unsafe { libc::munmap(self.base.cast(), total) };
    }
}

impl std::fmt::Debug for StackMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackMem")
            .field("bottom", &self.bottom())
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rounds_to_pages() {
        let stack = StackMem::map(1000).expect("map");
        assert_eq!(stack.size() % page_size(), 0);
        assert!(stack.size() >= 1000);
    }

    #[test]
    fn test_stack_is_writable() {
        let stack = StackMem::map(64 * 1024).expect("map");
        // Touch the first and last usable bytes.
        unsafe {
            stack.bottom().write(0xa5);
            stack.bottom().add(stack.size() - 1).write(0x5a);
        }
    }

    #[test]
    fn test_into_from_raw_round_trip() {
        let stack = StackMem::map(32 * 1024).expect("map");
        let bottom = stack.bottom();
        let (raw, size) = stack.into_raw();
        assert_eq!(raw, bottom);
        let rebuilt = unsafe { StackMem::from_raw(raw, size) };
        assert_eq!(rebuilt.bottom(), bottom);
        assert_eq!(rebuilt.size(), size);
    }

    #[test]
    fn test_default_stack_size_floor() {
        assert!(default_stack_size() >= crate::MIN_STACK_SIZE);
    }
}
