//! The x86_64 JIT backend: register allocation, instruction selection, code
//! emission, relocation, and slowmem thunk generation.
//!
//! The host target is fixed at x86_64 (design §4.4.1); there is no backend
//! trait or second target, since the spec names exactly one host ISA and a
//! trait with a single implementor would be indirection without purpose.

/// Host register conventions: context pin, temporaries, argument registers,
/// the allocatable set.
pub mod registers;
/// Linear-scan register allocation over value liveness intervals.
pub mod regalloc;
/// Per-opcode lowering: which x64 template an IR instruction compiles to.
pub mod lowering;
/// The x86_64 byte encoder.
pub mod x64;
/// Ties lowering + regalloc + encoder together to emit one block's code.
pub mod emitter;
/// The 16-entry precomputed slowmem thunk table.
pub mod thunks;

pub use regalloc::{Allocation, Location};
pub use registers::Reg;
