//! A compiled block: its guest range, specialization flags, and the host
//! code the backend emitted for it.

use crate::backend::registers::Reg;
use crate::common::GuestAddr;
use crate::ir::Instruction;

/// Context-flag bits a block may specialize on. Flag mismatches are cache
/// misses, not evictions (design §4.3).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ContextFlags(pub u8);

impl ContextFlags {
    /// SR.FPU precision-mode bit (single vs. double).
    pub const FPU_MODE: u8 = 1 << 0;
    /// Privileged (vs. user) execution mode bit.
    pub const PRIVILEGED: u8 = 1 << 1;
}

/// Bytes reserved for every fastmem site, regardless of the native width of
/// the SIB load/store instruction it starts as. The fault handler patches a
/// site to: up to three `mov reg, reg` marshaling moves into the SysV
/// argument registers the slowmem thunk reads (`ctx`→`rdi`, addr→`rsi`,
/// and for stores only, value→`rdx`; 3 bytes apiece, worst case, though a
/// move is skipped if the value is already in place), `mov_imm64 + call reg`
/// for the call itself (13 bytes, [`crate::backend::x64::X64Asm::call_abs`]),
/// and for loads only, one closing `mov reg, rax` to move the thunk's
/// return value into the load's destination register (3 bytes). The emitter
/// pads every site out to this length with `nop`s so the patch is
/// guaranteed to fit without touching a single byte past the reservation.
pub const FASTMEM_SITE_LEN: usize = 3 + 3 + 3 + 13;

/// One fastmem call site: where it lives in the emitted code, and the width
/// its replacement slowmem thunk must handle.
#[derive(Clone, Copy, Debug)]
pub struct FastmemSite {
    /// Byte offset of the site within the block's emitted code.
    pub code_offset: usize,
    /// Number of bytes reserved for the fastmem form; the slowmem
    /// replacement is guaranteed to fit within this, padded at emit time if
    /// needed (design §4.6 patch-safety invariant).
    pub reserved_len: usize,
    /// Access width, selecting which of the 16 slowmem thunks to patch in.
    pub width: crate::common::Width,
    /// Whether this is a load or a store site.
    pub is_store: bool,
    /// `true` once the fault handler has patched this site.
    pub patched: bool,
    /// Host register holding the guest address at this site, as emitted —
    /// the fault handler marshals it into `rsi` before calling the thunk.
    pub addr_reg: Reg,
    /// Store sites only: host register holding the value being written,
    /// marshaled into `rdx` before the call.
    pub value_reg: Option<Reg>,
    /// Load sites only: host register the loaded value is expected in —
    /// the fault handler moves the thunk's `rax` return into this register
    /// after the call, since the direct-form load it replaced no longer runs.
    pub dest_reg: Option<Reg>,
}

/// A relocation: a patchable immediate embedded in the emitted code,
/// pointing at another block's entry for chaining.
#[derive(Clone, Copy, Debug)]
pub struct Relocation {
    /// Byte offset of the patchable immediate within the block's code.
    pub code_offset: usize,
    /// Guest PC the immediate should resolve to once that block is
    /// resident.
    pub target_pc: GuestAddr,
}

/// A compiled block, still holding its IR (kept for diagnostics and tests)
/// plus the metadata the cache and fault handler need once it is resident.
pub struct Block {
    /// Lowest guest PC covered by this block.
    pub pc_lo: GuestAddr,
    /// Exclusive upper bound of guest PCs covered.
    pub pc_hi: GuestAddr,
    /// Context flags this block specializes on.
    pub flags: ContextFlags,
    /// The finished, simplified IR (one terminator, as its last element).
    pub instructions: Vec<Instruction>,
    /// Host code pointer, once emitted. `None` before backend emission.
    pub code_ptr: Option<crate::common::HostAddr>,
    /// Size in bytes of the emitted code.
    pub code_size: usize,
    /// Fastmem call sites within this block's code.
    pub fastmem_sites: Vec<FastmemSite>,
    /// Block-chaining relocations within this block's code.
    pub relocations: Vec<Relocation>,
}

impl Block {
    /// Returns `true` if `pc` falls within this block's covered range —
    /// used by `invalidate_range` to find blocks a guest write might
    /// overlap.
    #[must_use]
    pub fn covers(&self, pc: GuestAddr) -> bool {
        pc.val() >= self.pc_lo.val() && pc.val() < self.pc_hi.val()
    }

    /// Returns `true` if `[lo, hi)` intersects this block's covered range.
    #[must_use]
    pub fn intersects(&self, lo: GuestAddr, hi: GuestAddr) -> bool {
        lo.val() < self.pc_hi.val() && self.pc_lo.val() < hi.val()
    }
}
