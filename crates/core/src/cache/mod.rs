//! The block cache: keyed lookup, installation, and invalidation, backed by
//! a W^X executable memory arena.

/// The `(guest-PC, context-flags)` lookup key.
pub mod key;
/// The growable, page-aligned, write-xor-execute executable memory arena.
pub mod arena;
/// `BlockCache`: lookup/insert/invalidate_range/reset.
pub mod block_cache;

pub use arena::ExecArena;
pub use block_cache::BlockCache;
pub use key::BlockKey;
