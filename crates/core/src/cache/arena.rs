//! The growable, page-aligned executable memory arena.
//!
//! Pages are writable while the backend emits into them and are flipped to
//! executable-only before the block's code pointer is handed out — never
//! both at once (write-xor-execute). When the arena would overflow, the
//! cache resets: every mapping is dropped and a fresh one is allocated.

use std::ptr::NonNull;

const PAGE_SIZE: usize = 4096;

fn round_up_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A bump-allocated, page-aligned span of executable memory.
pub struct ExecArena {
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
    /// `true` while pages are writable (between a `reserve` and the
    /// following `make_executable`); emission must not straddle a flip.
    writable: bool,
}

// SAFETY: `base` is an owned `mmap` region; the arena is only ever driven
// from the single CPU thread that owns the block cache.
unsafe impl Send for ExecArena {}

impl ExecArena {
    /// Reserves a fresh arena of at least `capacity` bytes (rounded up to a
    /// whole number of pages), initially writable.
    ///
    /// # Panics
    ///
    /// Panics if the underlying `mmap` fails.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = round_up_to_page(capacity.max(PAGE_SIZE));
        // SAFETY: anonymous, private mapping; no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED, "failed to mmap {capacity}-byte code arena");
        Self {
            // SAFETY: `mmap` succeeded, so `ptr` is non-null.
            base: unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) },
            capacity,
            used: 0,
            writable: true,
        }
    }

    /// Bytes available before the arena must reset.
    #[must_use]
    pub const fn available(&self) -> usize {
        self.capacity - self.used
    }

    /// Total arena capacity in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently in use.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Reserves `len` bytes and returns a writable slice into the arena for
    /// the caller to emit code into, along with the host address that slice
    /// will have once made executable.
    ///
    /// Returns `None` if fewer than `len` bytes remain; the caller is
    /// expected to reset the cache and retry.
    pub fn reserve(&mut self, len: usize) -> Option<(&mut [u8], crate::common::HostAddr)> {
        if len > self.available() {
            return None;
        }
        assert!(self.writable, "ExecArena::reserve called while arena is executable");
        // SAFETY: `self.used + len <= self.capacity`, and `base` is valid
        // for `capacity` bytes.
        let slice = unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(self.used), len) };
        let host_addr = crate::common::HostAddr(slice.as_ptr() as usize);
        self.used += len;
        Some((slice, host_addr))
    }

    /// Flips the arena's pages from writable to executable-only. Must be
    /// called before any emitted code in it is invoked.
    pub fn make_executable(&mut self) {
        if !self.writable {
            return;
        }
        // SAFETY: `base` is valid for `capacity` bytes, mapped by `new`.
        let rc = unsafe {
            libc::mprotect(self.base.as_ptr().cast(), self.capacity, libc::PROT_READ | libc::PROT_EXEC)
        };
        assert_eq!(rc, 0, "mprotect(RX) failed for code arena");
        self.writable = false;
    }

    /// Flips the arena back to writable, for an in-place patch. Must be
    /// paired with [`Self::make_executable`] before resuming execution.
    pub fn make_writable(&mut self) {
        if self.writable {
            return;
        }
        // SAFETY: same mapping as `new`/`make_executable`.
        let rc = unsafe {
            libc::mprotect(self.base.as_ptr().cast(), self.capacity, libc::PROT_READ | libc::PROT_WRITE)
        };
        assert_eq!(rc, 0, "mprotect(RW) failed for code arena");
        self.writable = true;
    }

    /// Host address of the arena's base, for turning stored offsets back
    /// into pointers.
    #[must_use]
    pub fn base_addr(&self) -> crate::common::HostAddr {
        crate::common::HostAddr(self.base.as_ptr() as usize)
    }
}

impl Drop for ExecArena {
    fn drop(&mut self) {
        // SAFETY: `base`/`capacity` are exactly the mapping created in `new`.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_reset_by_replacing_the_arena() {
        let mut arena = ExecArena::new(PAGE_SIZE);
        assert_eq!(arena.available(), PAGE_SIZE);
        let (slice, _addr) = arena.reserve(16).unwrap();
        slice[0] = 0xC3; // ret
        assert_eq!(arena.available(), PAGE_SIZE - 16);
        assert!(arena.reserve(PAGE_SIZE).is_none());

        arena = ExecArena::new(PAGE_SIZE);
        assert_eq!(arena.available(), PAGE_SIZE);
    }

    #[test]
    fn make_executable_then_writable_round_trips() {
        let mut arena = ExecArena::new(PAGE_SIZE);
        let _ = arena.reserve(4).unwrap();
        arena.make_executable();
        arena.make_writable();
        let _ = arena.reserve(4).unwrap();
    }
}
