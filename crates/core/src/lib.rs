//! A dynamic binary translation core for a Sega Dreamcast-style console
//! emulator: decode guest machine code into a typed IR, run a mandatory
//! baseline simplification pass, and emit native x86_64 code with a
//! fastmem/slowmem memory discipline and block-chaining cache.
//!
//! # Pipeline
//!
//! [`frontend`] decodes a run of guest instructions into [`ir`] SSA,
//! [`ir::passes`] simplifies it, [`backend`] allocates registers and emits
//! x86_64 machine code into the [`cache`]'s executable arena, and
//! [`dispatcher`] drives the compile-or-execute loop against a
//! [`memory::AddressSpace`] and [`device::Bus`]. A fastmem access that
//! escapes every mapped region raises `SIGSEGV`; [`fault`] patches the
//! offending site to a slowmem thunk in place and resumes.
//!
//! See `DESIGN.md` at the repository root for the grounding ledger — what
//! each module is modeled on and why.

/// Shared address/width newtypes and the crate's unified error type.
pub mod common;
/// `Config`: JSON-deserializable settings for the address space, code
/// cache, and the one device this core ships.
pub mod config;
/// Run-time counters and the human-readable `Stats::report()`.
pub mod stats;
/// The guest address space: regions, page table, fastmem arena.
pub mod memory;
/// The invented guest instruction set and its decoder.
pub mod isa;
/// A compiled block's metadata: guest range, flags, fastmem sites,
/// block-chaining relocations.
pub mod block;
/// The block cache: keyed lookup over the executable arena.
pub mod cache;
/// The typed SSA intermediate representation and its simplification pass.
pub mod ir;
/// The x86_64 JIT backend: regalloc, lowering, encoding, slowmem thunks.
pub mod backend;
/// Owns the guest context and runs the compile-or-execute loop.
pub mod dispatcher;
/// Decodes a run of guest instructions into simplified IR for one block.
pub mod frontend;
/// The process-wide fastmem `SIGSEGV` handler.
#[cfg(target_arch = "x86_64")]
pub mod fault;
/// The device capability record, bus, and the serial port device.
pub mod device;

pub use common::{GuestAddr, HostAddr, JitError, JitResult, Width};
pub use config::Config;
pub use dispatcher::Dispatcher as Emulator;
