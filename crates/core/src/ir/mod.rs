//! The typed SSA-ish intermediate representation for one compiled block.
//!
//! 1. **Types:** [`types::IrType`], the closed set the backend's lowering
//!    table is keyed on.
//! 2. **Values:** [`value::ValueId`] / [`value::InstrId`] — single-assignment
//!    values, each with exactly one producer instruction.
//! 3. **Opcodes:** [`opcode::Opcode`], the flat instruction tag set; memory
//!    ops carry their access width as part of the opcode itself, never as
//!    an operand (design §4.2 invariant).
//! 4. **Builder:** [`builder::IRBuilder`], a bump-arena-scoped constructor
//!    for one block's instructions, enforcing def-before-use and exactly
//!    one terminator.
//! 5. **Passes:** [`passes::simplify`], the mandatory baseline simplification
//!    pass (constant folding, identity/zero simplification, dead-store
//!    elimination of killed guest-register writes, per-block GVN).

/// The closed IR type set.
pub mod types;
/// Value and instruction identifiers.
pub mod value;
/// The flat opcode tag set.
pub mod opcode;
/// The `Instruction` record.
pub mod instr;
/// `IRBuilder`: construct well-typed SSA for one block.
pub mod builder;
/// The mandatory baseline simplification pass.
pub mod passes;

pub use builder::IRBuilder;
pub use instr::Instruction;
pub use opcode::{ICmpCond, Opcode};
pub use types::IrType;
pub use value::{InstrId, ValueId, VOID_VALUE};
