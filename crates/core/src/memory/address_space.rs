//! The guest address space: region table, page-table cache, fastmem arena.

use crate::common::{GuestAddr, HostAddr, JitError, JitResult, Width};
use crate::config::AddressSpaceConfig;
use crate::memory::region::{MmioReadFn, MmioWriteFn, Region};

/// An installed region plus the guest range it covers.
struct RegionEntry {
    lo: u32,
    /// Exclusive upper bound.
    hi: u32,
    region: Region,
}

/// The fixed-size 32-bit guest address space.
///
/// Owns:
/// 1. The region list (`Ram`/`Rom`/`Mmio` spans, in insertion order).
/// 2. A page table (one entry per 4 KiB-by-default page of the full 32-bit
///    space) that caches which region index, if any, covers that page —
///    the "secondary page table" the design calls out as the hot-path cache
///    for emitted code.
/// 3. The fastmem arena: a single `mmap` reservation spanning the entire
///    32-bit guest space. Ram/Rom regions are mirrored into it at their
///    identity offset (`arena_base + guest_addr`) with the matching page
///    protection; everything else is left `PROT_NONE` so unmapped fastmem
///    accesses fault at the hardware level, which is exactly what
///    [`crate::fault`] relies on.
pub struct AddressSpace {
    regions: Vec<RegionEntry>,
    page_table: Vec<i32>,
    page_bits: u32,
    arena_ptr: *mut u8,
    /// Size of the `mmap` reservation backing `arena_ptr` (always the full
    /// 32-bit guest space, independent of where regions actually live).
    arena_reserved: usize,
}

// SAFETY: `arena_ptr` is an owned `mmap` reservation; nothing else in the
// process holds a reference to it, and `AddressSpace` is only ever driven
// from the single CPU thread (design §5).
unsafe impl Send for AddressSpace {}

const GUEST_SPACE_BITS: u32 = 32;

impl AddressSpace {
    /// Creates an address space with no regions installed, reserving the
    /// fastmem arena but mapping none of it accessible.
    ///
    /// # Panics
    ///
    /// Panics if the `mmap` reservation fails; there is no recovery from
    /// losing the fastmem arena at startup.
    #[must_use]
    pub fn new(config: &AddressSpaceConfig) -> Self {
        let arena_reserved = 1usize << GUEST_SPACE_BITS;
        let page_bits = config.page_bits;
        let page_count = 1usize << (GUEST_SPACE_BITS - page_bits);

        // SAFETY: requesting an anonymous, inaccessible mapping of
        // `arena_reserved` bytes. No file descriptor, no fixed address.
        // `MAP_NORESERVE` avoids committing swap for the whole reservation
        // up front; pages become real once `mprotect`ed below.
        let arena_ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                arena_reserved,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        assert_ne!(
            arena_ptr,
            libc::MAP_FAILED,
            "failed to reserve {arena_reserved}-byte fastmem arena"
        );

        Self {
            regions: Vec::new(),
            page_table: vec![-1; page_count],
            page_bits,
            arena_ptr: arena_ptr.cast::<u8>(),
            arena_reserved,
        }
    }

    /// Host pointer to the fastmem arena base. The backend encodes direct
    /// loads/stores as `[fastmem_base() + guest_addr]`.
    #[must_use]
    pub fn fastmem_base(&self) -> HostAddr {
        HostAddr(self.arena_ptr as usize)
    }

    /// Installs a writable RAM region, copying `initial` into it (zero-padded
    /// if shorter than the range) and mirroring it into the fastmem arena
    /// read-write.
    ///
    /// # Errors
    ///
    /// Returns [`JitError::OverlapError`] if `[lo, hi)` intersects an
    /// existing region.
    pub fn map_ram(&mut self, lo: u32, hi: u32, initial: &[u8]) -> JitResult<()> {
        self.map_backed(lo, hi, initial, true)
    }

    /// Installs a read-only ROM region, mirrored into the fastmem arena
    /// read-only: fastmem stores into it fault exactly like an MMIO store.
    ///
    /// # Errors
    ///
    /// Returns [`JitError::OverlapError`] if `[lo, hi)` intersects an
    /// existing region.
    pub fn map_rom(&mut self, lo: u32, hi: u32, initial: &[u8]) -> JitResult<()> {
        self.map_backed(lo, hi, initial, false)
    }

    fn map_backed(&mut self, lo: u32, hi: u32, initial: &[u8], writable: bool) -> JitResult<()> {
        self.check_overlap(lo, hi)?;
        let size = (hi - lo) as usize;
        let base = self.arena_ptr.wrapping_add(lo as usize);

        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ | libc::PROT_WRITE // writable during seeding, tightened below
        };
        // SAFETY: `[lo, hi)` was just checked disjoint from every existing
        // region and lies within the `arena_reserved` mapping created in
        // `new`; `base` is that mapping's own memory, never aliased.
        let rc = unsafe { libc::mprotect(base.cast(), size, prot) };
        assert_eq!(rc, 0, "mprotect failed for guest range {lo:#010x}..{hi:#010x}");

        let copy_len = initial.len().min(size);
        // SAFETY: `base` is writable for `size` bytes per the `mprotect`
        // above; `copy_len <= size`.
        unsafe {
            std::ptr::copy_nonoverlapping(initial.as_ptr(), base, copy_len);
            if copy_len < size {
                std::ptr::write_bytes(base.add(copy_len), 0, size - copy_len);
            }
        }

        if !writable {
            // SAFETY: same mapping, now downgrading permissions after the
            // initial contents were written.
            let rc = unsafe { libc::mprotect(base.cast(), size, libc::PROT_READ) };
            assert_eq!(rc, 0, "mprotect(RO) failed for guest range {lo:#010x}..{hi:#010x}");
        }

        let host_base = HostAddr(base as usize);
        let region = if writable {
            Region::Ram { host_base, size }
        } else {
            Region::Rom { host_base, size }
        };
        self.install(lo, hi, region);
        Ok(())
    }

    /// Installs an MMIO region. The arena stays unmapped for this range;
    /// every access, fast or slow, reaches `read_fn`/`write_fn`.
    ///
    /// # Errors
    ///
    /// Returns [`JitError::OverlapError`] if `[lo, hi)` intersects an
    /// existing region.
    pub fn map_mmio(
        &mut self,
        lo: u32,
        hi: u32,
        read_fn: MmioReadFn,
        write_fn: MmioWriteFn,
    ) -> JitResult<()> {
        self.check_overlap(lo, hi)?;
        self.install(lo, hi, Region::Mmio { read_fn, write_fn });
        Ok(())
    }

    fn check_overlap(&self, lo: u32, hi: u32) -> JitResult<()> {
        for entry in &self.regions {
            if lo < entry.hi && entry.lo < hi {
                return Err(JitError::OverlapError { lo, hi });
            }
        }
        Ok(())
    }

    fn install(&mut self, lo: u32, hi: u32, region: Region) {
        let idx = self.regions.len();
        tracing::debug!(lo = lo, hi = hi, kind = region.kind(), "installed region");
        self.regions.push(RegionEntry { lo, hi, region });

        let first_page = lo >> self.page_bits;
        let last_page = (hi - 1) >> self.page_bits;
        for page in first_page..=last_page {
            self.page_table[page as usize] = idx as i32;
        }
    }

    fn find_region(&mut self, addr: GuestAddr) -> Option<usize> {
        let page = addr.val() >> self.page_bits;
        let idx = *self.page_table.get(page as usize)?;
        if idx < 0 {
            None
        } else {
            Some(idx as usize)
        }
    }

    /// Reads a byte, dispatching through the region table. Unmapped
    /// addresses are logged and return `0` rather than aborting the host.
    #[must_use]
    pub fn read8(&mut self, addr: GuestAddr) -> u8 {
        self.read(addr, Width::W8) as u8
    }

    /// Reads a 16-bit little-endian value.
    #[must_use]
    pub fn read16(&mut self, addr: GuestAddr) -> u16 {
        self.read(addr, Width::W16) as u16
    }

    /// Reads a 32-bit little-endian value.
    #[must_use]
    pub fn read32(&mut self, addr: GuestAddr) -> u32 {
        self.read(addr, Width::W32) as u32
    }

    /// Reads a 64-bit little-endian value.
    #[must_use]
    pub fn read64(&mut self, addr: GuestAddr) -> u64 {
        self.read(addr, Width::W64)
    }

    /// Writes a byte.
    pub fn write8(&mut self, addr: GuestAddr, value: u8) {
        self.write(addr, Width::W8, u64::from(value));
    }

    /// Writes a 16-bit little-endian value.
    pub fn write16(&mut self, addr: GuestAddr, value: u16) {
        self.write(addr, Width::W16, u64::from(value));
    }

    /// Writes a 32-bit little-endian value.
    pub fn write32(&mut self, addr: GuestAddr, value: u32) {
        self.write(addr, Width::W32, u64::from(value));
    }

    /// Writes a 64-bit little-endian value.
    pub fn write64(&mut self, addr: GuestAddr, value: u64) {
        self.write(addr, Width::W64, value);
    }

    fn read(&mut self, addr: GuestAddr, width: Width) -> u64 {
        let Some(idx) = self.find_region(addr) else {
            tracing::warn!(addr = addr.val(), "read from unmapped guest address");
            return 0;
        };
        let arena_ptr = self.arena_ptr;
        match &mut self.regions[idx].region {
            Region::Ram { .. } | Region::Rom { .. } => {
                // SAFETY: the arena is identity-mapped and this page was
                // `mprotect`ed readable by `map_backed` for this region.
                unsafe { read_host(arena_ptr, addr, width) }
            }
            Region::Mmio { read_fn, .. } => read_fn(addr, width),
        }
    }

    fn write(&mut self, addr: GuestAddr, width: Width, value: u64) {
        let Some(idx) = self.find_region(addr) else {
            tracing::warn!(addr = addr.val(), "write to unmapped guest address, discarded");
            return;
        };
        let arena_ptr = self.arena_ptr;
        match &mut self.regions[idx].region {
            Region::Ram { .. } => {
                // SAFETY: writable by construction (`map_ram` only).
                unsafe { write_host(arena_ptr, addr, width, value) }
            }
            Region::Rom { .. } => {
                tracing::warn!(addr = addr.val(), "write to ROM region, discarded");
            }
            Region::Mmio { write_fn, .. } => write_fn(addr, width, value),
        }
    }
}

/// Reads `width` bytes at `arena_base + addr`. The arena is identity-mapped,
/// so a mirrored region's guest address always equals its arena offset —
/// there is no need to know which region owns `addr`, only that one does.
///
/// # Safety
///
/// `arena_base + addr.val()` must point at `width.bytes()` readable bytes.
unsafe fn read_host(arena_base: *mut u8, addr: GuestAddr, width: Width) -> u64 {
    let ptr: *const u8 = arena_base.wrapping_add(addr.val() as usize);
    match width {
        Width::W8 => u64::from(unsafe { ptr.read() }),
        Width::W16 => u64::from(unsafe { ptr.cast::<u16>().read_unaligned() }),
        Width::W32 => u64::from(unsafe { ptr.cast::<u32>().read_unaligned() }),
        Width::W64 => unsafe { ptr.cast::<u64>().read_unaligned() },
    }
}

/// # Safety
///
/// Same preconditions as [`read_host`], plus the span must be writable.
unsafe fn write_host(arena_base: *mut u8, addr: GuestAddr, width: Width, value: u64) {
    let ptr = arena_base.wrapping_add(addr.val() as usize);
    match width {
        Width::W8 => unsafe { ptr.write(value as u8) },
        Width::W16 => unsafe { ptr.cast::<u16>().write_unaligned(value as u16) },
        Width::W32 => unsafe { ptr.cast::<u32>().write_unaligned(value as u32) },
        Width::W64 => unsafe { ptr.cast::<u64>().write_unaligned(value) },
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // SAFETY: `arena_ptr`/`arena_reserved` are exactly the mapping
        // created in `new`, never shared outside this struct.
        unsafe {
            libc::munmap(self.arena_ptr.cast(), self.arena_reserved);
        }
    }
}
