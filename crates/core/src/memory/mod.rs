//! The guest address space: region tracking, page table, and fastmem arena.
//!
//! 1. **Region:** the tagged variant describing what backs a guest range
//!    (`Ram`, `Rom`, `Mmio`, `Unmapped`).
//! 2. **AddressSpace:** owns the region list, the page table that caches
//!    lookups, and the fastmem arena that emitted code addresses directly.

/// The `Region` tagged enum and the device MMIO callback signatures.
pub mod region;
/// `AddressSpace`: paged guest→host mapping, fastmem arena, read/write dispatch.
pub mod address_space;

pub use address_space::AddressSpace;
pub use region::{MmioReadFn, MmioWriteFn, Region};
