//! The `Region` tagged variant backing a span of guest address space.
//!
//! Grounded on the device-capability-record redesign: rather than a C-style
//! `(read_fn, write_fn, userdata)` triple of raw function pointers plus a
//! `void*`, an MMIO region's callbacks are boxed closures that capture their
//! own state directly. Same contract, no inheritance, no casts.

use crate::common::{GuestAddr, HostAddr, Width};

/// Callback invoked for a slow (MMIO) read. Returns the value widened to
/// `u64`; callers truncate to the access width they asked for.
pub type MmioReadFn = Box<dyn FnMut(GuestAddr, Width) -> u64>;

/// Callback invoked for a slow (MMIO) write. `value` carries only the low
/// `width.bytes() * 8` bits.
pub type MmioWriteFn = Box<dyn FnMut(GuestAddr, Width, u64)>;

/// What backs a contiguous span of the guest address space.
pub enum Region {
    /// Writable guest RAM, mirrored into the fastmem arena at its identity
    /// offset. `host_base` is the arena address corresponding to the
    /// region's low guest address.
    Ram {
        /// Arena address of the region's first byte.
        host_base: HostAddr,
        /// Region size in bytes.
        size: usize,
    },
    /// Read-only guest ROM, mirrored into the fastmem arena read-only: a
    /// fastmem store into this range faults at the hardware page-protection
    /// level exactly as an MMIO store would.
    Rom {
        /// Arena address of the region's first byte.
        host_base: HostAddr,
        /// Region size in bytes.
        size: usize,
    },
    /// Memory-mapped I/O. Never mirrored into the arena: every access, fast
    /// or slow, must reach these callbacks, so the arena page stays
    /// unmapped and faults unconditionally.
    Mmio {
        /// Slow-path read callback.
        read_fn: MmioReadFn,
        /// Slow-path write callback.
        write_fn: MmioWriteFn,
    },
}

impl Region {
    /// Returns the region's kind as a short tag, for tracing.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ram { .. } => "ram",
            Self::Rom { .. } => "rom",
            Self::Mmio { .. } => "mmio",
        }
    }
}
