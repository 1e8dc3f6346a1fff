//! `BlockCache`: maps `(guest-PC, context-flags)` to host code, backed by the
//! executable arena.

use std::collections::HashMap;

use crate::block::{Block, ContextFlags, FastmemSite, Relocation};
use crate::cache::arena::ExecArena;
use crate::cache::key::BlockKey;
use crate::common::{GuestAddr, HostAddr, JitError, JitResult};
use crate::ir::Instruction;
use crate::stats::Stats;

/// Owns the executable arena and the installed-block table.
pub struct BlockCache {
    arena: ExecArena,
    arena_capacity: usize,
    blocks: HashMap<BlockKey, Block>,
}

impl BlockCache {
    /// Creates an empty cache backed by an arena of `arena_capacity` bytes.
    #[must_use]
    pub fn new(arena_capacity: usize) -> Self {
        Self {
            arena: ExecArena::new(arena_capacity),
            arena_capacity,
            blocks: HashMap::new(),
        }
    }

    /// Looks up a resident block's code pointer. Expected O(1).
    #[must_use]
    pub fn lookup(&self, key: BlockKey, stats: &mut Stats) -> Option<HostAddr> {
        let found = self.blocks.get(&key).and_then(|b| b.code_ptr);
        if found.is_some() {
            stats.cache_hits += 1;
        } else {
            stats.cache_misses += 1;
        }
        found
    }

    /// Reserves `len` bytes of writable arena space for the backend to
    /// assemble a new block's code into.
    ///
    /// Returns `None` if the arena has insufficient room; per design §4.4
    /// the backend resets the cache and retries exactly once before
    /// treating a second failure as fatal.
    pub fn reserve_code(&mut self, len: usize) -> Option<(&mut [u8], HostAddr)> {
        self.arena.reserve(len)
    }

    /// Installs a freshly assembled block, flipping the arena to executable
    /// and returning its code pointer. Becomes the unique authoritative
    /// pointer for `key` until invalidated.
    #[allow(clippy::too_many_arguments)]
    pub fn install(
        &mut self,
        key: BlockKey,
        pc_lo: GuestAddr,
        pc_hi: GuestAddr,
        instructions: Vec<Instruction>,
        code_ptr: HostAddr,
        code_size: usize,
        fastmem_sites: Vec<FastmemSite>,
        relocations: Vec<Relocation>,
        stats: &mut Stats,
    ) -> HostAddr {
        self.arena.make_executable();
        let block = Block {
            pc_lo,
            pc_hi,
            flags: key.flags,
            instructions,
            code_ptr: Some(code_ptr),
            code_size,
            fastmem_sites,
            relocations,
        };
        self.blocks.insert(key, block);
        stats.blocks_compiled += 1;
        code_ptr
    }

    /// Drops every block whose covered guest range intersects
    /// `[guest_lo, guest_hi)`. Does not reclaim the arena space those
    /// blocks occupied; only [`Self::reset`] does that (baseline wholesale
    /// policy, design §4.3).
    pub fn invalidate_range(&mut self, guest_lo: GuestAddr, guest_hi: GuestAddr, stats: &mut Stats) {
        let before = self.blocks.len();
        self.blocks.retain(|_, b| !b.intersects(guest_lo, guest_hi));
        stats.cache_invalidations += (before - self.blocks.len()) as u64;
    }

    /// Drops every block and replaces the arena with a fresh one of the
    /// same capacity. Called when the arena overflows, or on request.
    pub fn reset(&mut self, stats: &mut Stats) {
        self.blocks.clear();
        self.arena = ExecArena::new(self.arena_capacity);
        stats.cache_resets += 1;
    }

    /// Looks up which block, if any, owns the fastmem site whose faulting
    /// host instruction address is `fault_addr`. Returns the key and the
    /// index into that block's `fastmem_sites` for [`crate::fault`] to
    /// patch.
    pub fn find_fastmem_site(&self, fault_addr: HostAddr) -> Option<(BlockKey, usize)> {
        for (key, block) in &self.blocks {
            let Some(code_ptr) = block.code_ptr else { continue };
            for (idx, site) in block.fastmem_sites.iter().enumerate() {
                let site_addr = code_ptr.val() + site.code_offset;
                if site_addr == fault_addr.val() {
                    return Some((*key, idx));
                }
            }
        }
        None
    }

    /// Returns every `(key, code pointer, relocation code offset)` for
    /// resident blocks holding a relocation that targets `target_pc` — used
    /// by the emitter to chain a freshly installed block into its callers.
    #[must_use]
    pub fn relocations_targeting(&self, target_pc: GuestAddr) -> Vec<(BlockKey, HostAddr, usize)> {
        let mut out = Vec::new();
        for (key, block) in &self.blocks {
            let Some(code_ptr) = block.code_ptr else { continue };
            for reloc in &block.relocations {
                if reloc.target_pc == target_pc {
                    out.push((*key, code_ptr, reloc.code_offset));
                }
            }
        }
        out
    }

    /// Mutable access to an installed block, for the fault handler to mark
    /// a fastmem site patched and for the emitter to apply chaining
    /// relocations.
    pub fn block_mut(&mut self, key: BlockKey) -> Option<&mut Block> {
        self.blocks.get_mut(&key)
    }

    /// Gives the caller temporary write access to the arena for an in-place
    /// patch (W^X transition), then flips it back to executable.
    ///
    /// # Safety
    ///
    /// `patch` must only write within `[code_offset, code_offset + len)` of
    /// the arena, and the bytes it writes must not exceed the padded
    /// length the emitter reserved for that site.
    pub unsafe fn patch<F: FnOnce(&mut [u8])>(&mut self, code_offset: usize, len: usize, patch: F) {
        self.arena.make_writable();
        let base = self.arena.base_addr().val();
        // SAFETY: `code_offset + len` was reserved within this arena by a
        // prior `reserve_code` call; the caller's `patch` closure upholds
        // the length contract documented above.
        let slice = unsafe { std::slice::from_raw_parts_mut((base + code_offset) as *mut u8, len) };
        patch(slice);
        self.arena.make_executable();
    }

    /// Returns [`JitError::CodeCacheFull`] for a block that still does not
    /// fit after one reset — the second, fatal failure design §4.4 calls
    /// for.
    #[must_use]
    pub fn full_error(needed: usize) -> JitError {
        JitError::CodeCacheFull { needed }
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("resident_blocks", &self.blocks.len())
            .field("arena_used", &self.arena.used())
            .field("arena_capacity", &self.arena.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pc: u32) -> BlockKey {
        BlockKey::new(GuestAddr::new(pc), ContextFlags::default())
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let mut cache = BlockCache::new(4096);
        let mut stats = Stats::new();
        let (code, addr) = cache.reserve_code(4).unwrap();
        code.copy_from_slice(&[0xC3, 0x90, 0x90, 0x90]);
        let k = key(0x1000);
        let got = cache.install(
            k,
            GuestAddr::new(0x1000),
            GuestAddr::new(0x1002),
            Vec::new(),
            addr,
            4,
            Vec::new(),
            Vec::new(),
            &mut stats,
        );
        assert_eq!(got, addr);
        assert_eq!(cache.lookup(k, &mut stats), Some(addr));
        assert_eq!(stats.blocks_compiled, 1);
    }

    #[test]
    fn invalidate_range_drops_intersecting_blocks_only() {
        let mut cache = BlockCache::new(4096);
        let mut stats = Stats::new();
        for pc in [0x1000u32, 0x2000] {
            let (code, addr) = cache.reserve_code(2).unwrap();
            code.copy_from_slice(&[0xC3, 0x90]);
            cache.install(
                key(pc),
                GuestAddr::new(pc),
                GuestAddr::new(pc + 2),
                Vec::new(),
                addr,
                2,
                Vec::new(),
                Vec::new(),
                &mut stats,
            );
        }

        cache.invalidate_range(GuestAddr::new(0x1000), GuestAddr::new(0x1002), &mut stats);
        assert_eq!(cache.lookup(key(0x1000), &mut stats), None);
        assert!(cache.lookup(key(0x2000), &mut stats).is_some());
        assert_eq!(stats.cache_invalidations, 1);
    }

    #[test]
    fn reset_clears_every_block() {
        let mut cache = BlockCache::new(4096);
        let mut stats = Stats::new();
        let (code, addr) = cache.reserve_code(2).unwrap();
        code.copy_from_slice(&[0xC3, 0x90]);
        cache.install(
            key(0x1000),
            GuestAddr::new(0x1000),
            GuestAddr::new(0x1002),
            Vec::new(),
            addr,
            2,
            Vec::new(),
            Vec::new(),
            &mut stats,
        );

        cache.reset(&mut stats);
        assert_eq!(cache.lookup(key(0x1000), &mut stats), None);
        assert_eq!(stats.cache_resets, 1);
    }
}
