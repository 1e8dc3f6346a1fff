//! The `Instruction` record: an opcode, up to three operands, at most one
//! constant immediate, and at most one destination value.

use crate::ir::opcode::Opcode;
use crate::ir::value::ValueId;

/// One IR instruction.
#[derive(Clone, Copy, Debug)]
pub struct Instruction {
    /// The operation this instruction performs.
    pub opcode: Opcode,
    /// Up to three value operands, in opcode-defined order. Unused slots
    /// are `None`.
    pub operands: [Option<ValueId>; 3],
    /// The instruction's single constant immediate, if it has one (a
    /// register index, a branch target, or a materialized constant).
    pub imm: Option<i64>,
    /// The value this instruction defines, if any.
    pub dest: Option<ValueId>,
}

impl Instruction {
    /// Returns the first operand, if present.
    #[must_use]
    pub const fn operand0(&self) -> Option<ValueId> {
        self.operands[0]
    }

    /// Returns the second operand, if present.
    #[must_use]
    pub const fn operand1(&self) -> Option<ValueId> {
        self.operands[1]
    }

    /// Returns the third operand, if present.
    #[must_use]
    pub const fn operand2(&self) -> Option<ValueId> {
        self.operands[2]
    }
}
