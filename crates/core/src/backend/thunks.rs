//! The 16-entry precomputed slowmem thunk table.
//!
//! Grounded on `original_source/src/jit/backend/x64/x64_backend.h`'s
//! `SlowmemThunk load_thunk_[16]`/`store_thunk_[16]` function-pointer
//! arrays, reimplemented as genuine Rust `extern "C" fn` pointers
//! (monomorphized per width and signedness) rather than hand-assembled
//! machine-code stubs — the idiomatic-Rust equivalent of "a precomputed
//! function-pointer table bridging JIT code to an `AddressSpace` call".
//! A fastmem site the fault handler patches becomes a `mov` of the matching
//! entry's address into `TMP0` followed by a `call`.

use crate::common::{GuestAddr, HostAddr, Width};
use crate::dispatcher::GuestContext;

/// A slowmem thunk's signature: guest-context pointer, guest address, and
/// (for stores) the value to write. Loads ignore `value` and return the
/// loaded value zero-extended to 64 bits; stores ignore the return value.
pub type SlowmemThunk = extern "C" fn(*mut GuestContext, u32, u64) -> u64;

/// Index into [`ThunkTable::LOADS`]/[`ThunkTable::STORES`] for `(width,
/// signed)`. Signedness only matters for loads narrower than 64 bits; store
/// thunks ignore it but keep the same 8-entry shape for a uniform index.
fn slot(width: Width, signed: bool) -> usize {
    let width_idx = match width {
        Width::W8 => 0,
        Width::W16 => 1,
        Width::W32 => 2,
        Width::W64 => 3,
    };
    width_idx * 2 + usize::from(signed)
}

macro_rules! load_thunk {
    ($name:ident, $ty:ty, $read:ident) => {
        extern "C" fn $name(ctx: *mut GuestContext, addr: u32, _value: u64) -> u64 {
            // SAFETY: called only from JIT code with the context pointer it
            // was entered with; `address_space` is valid for the context's
            // entire lifetime (design §5).
            let mem = unsafe { &mut *(*ctx).address_space };
            mem.$read(GuestAddr::new(addr)) as $ty as u64
        }
    };
}

macro_rules! store_thunk {
    ($name:ident, $ty:ty, $write:ident) => {
        extern "C" fn $name(ctx: *mut GuestContext, addr: u32, value: u64) -> u64 {
            // SAFETY: same as `load_thunk!`.
            let mem = unsafe { &mut *(*ctx).address_space };
            mem.$write(GuestAddr::new(addr), value as $ty);
            0
        }
    };
}

load_thunk!(load8_zx, u8, read8);
load_thunk!(load8_sx, i8, read8);
load_thunk!(load16_zx, u16, read16);
load_thunk!(load16_sx, i16, read16);
load_thunk!(load32_zx, u32, read32);
load_thunk!(load32_sx, i32, read32);
load_thunk!(load64, u64, read64);

extern "C" fn load64_sx(ctx: *mut GuestContext, addr: u32, value: u64) -> u64 {
    load64(ctx, addr, value)
}

store_thunk!(store8, u8, write8);
store_thunk!(store16, u16, write16);
store_thunk!(store32, u32, write32);
store_thunk!(store64, u64, write64);

/// The full 16-entry (8 load + 8 store) slowmem thunk table, indexed by
/// `(width, signed)`.
pub struct ThunkTable {
    loads: [SlowmemThunk; 8],
    stores: [SlowmemThunk; 8],
}

impl ThunkTable {
    /// Builds the table. Every entry is a plain function pointer; there is
    /// no per-instance state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            loads: [
                load8_zx, load8_sx, load16_zx, load16_sx, load32_zx, load32_sx, load64, load64_sx,
            ],
            stores: [store8, store8, store16, store16, store32, store32, store64, store64],
        }
    }

    /// Host address of the load thunk for `(width, signed)`, for the
    /// emitter/fault handler to materialize into a `call` target.
    #[must_use]
    pub fn load_thunk(&self, width: Width, signed: bool) -> HostAddr {
        HostAddr(self.loads[slot(width, signed)] as usize)
    }

    /// Host address of the store thunk for `width` (signedness is
    /// irrelevant to a store; the value is truncated, never extended).
    #[must_use]
    pub fn store_thunk(&self, width: Width) -> HostAddr {
        HostAddr(self.stores[slot(width, false)] as usize)
    }
}

impl Default for ThunkTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_slot_resolves_to_a_distinct_function() {
        let table = ThunkTable::new();
        let mut addrs: Vec<usize> = Width::all()
            .into_iter()
            .flat_map(|w| [table.load_thunk(w, false).val(), table.load_thunk(w, true).val()])
            .collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 8, "load thunks must all be distinct except where genuinely aliased");
    }
}
