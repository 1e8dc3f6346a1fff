//! Value and instruction identifiers.
//!
//! Both are plain indices into the [`crate::ir::IRBuilder`]'s bump arenas —
//! cheap to copy, store in operand slots, and use as hash keys for GVN.

/// Identifies a single-assignment IR value: `(id, type, producer)`.
///
/// The type and producer live in the builder's value table, not on this
/// handle, so `ValueId` stays a plain `Copy` index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValueId(pub u32);

/// Identifies an instruction within a block's instruction list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstrId(pub u32);

/// Sentinel returned by [`crate::ir::IRBuilder::emit`] for void-terminators
/// (`Branch`, `BranchCond`, `Return`, `Barrier`, `Nop`) that produce no
/// value.
pub const VOID_VALUE: ValueId = ValueId(u32::MAX);

/// One entry in the builder's value table.
#[derive(Clone, Copy, Debug)]
pub struct ValueInfo {
    /// The value's type.
    pub ty: crate::ir::IrType,
    /// The instruction that defines this value.
    pub producer: InstrId,
}
