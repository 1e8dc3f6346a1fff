//! The block cache's lookup key.

use std::hash::{Hash, Hasher};

use crate::block::ContextFlags;
use crate::common::GuestAddr;

/// `(guest-PC, context-flags)`, the key every block is installed and looked
/// up under. Flag mismatches are misses, not evictions (design §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockKey {
    /// The guest PC the block starts at.
    pub pc: GuestAddr,
    /// The specialization flags the block was compiled against.
    pub flags: ContextFlags,
}

impl BlockKey {
    /// Creates a new key.
    #[must_use]
    pub const fn new(pc: GuestAddr, flags: ContextFlags) -> Self {
        Self { pc, flags }
    }

    /// A cheap mixed hash of `(pc, flags)`, used to size-hint the cache's
    /// hash table and in diagnostics; the canonical hash is still whatever
    /// `std::collections::HashMap` derives from `Hash`.
    #[must_use]
    pub fn mix(self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}
