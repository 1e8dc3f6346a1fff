//! Per-opcode lowering: which x64 instruction template an IR instruction
//! compiles to.
//!
//! Integer values of every width live in full 64-bit GPRs; narrowing is
//! explicit in the IR (`Truncate`/`ZeroExtend`/`SignExtend`), so the
//! template keys only on the opcode, never on operand type.

use crate::common::Width;
use crate::ir::opcode::{ICmpCond, Opcode};
use crate::ir::{Instruction, ValueId};

/// The host instruction shape an IR instruction lowers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Template {
    /// Two-address `op dst, src` where `dst` must equal operand 0 (the
    /// allocator or emitter inserts a move when it doesn't).
    BinOpReg,
    /// Shift by a compile-time-constant amount (operand 1 is `ConstI64`).
    ShiftImm,
    /// Shift by a runtime value; the count must be moved into `CL` first.
    ShiftReg,
    /// Compare-and-set, producing `0`/`1`.
    Cmp(ICmpCond),
    /// A register-width move: `Bitcast`, `ZeroExtend`, `SignExtend`, or
    /// `Truncate` collapse to the same encoding since every width lives in
    /// a full GPR.
    Move,
    /// Materializes an immediate into a register.
    ConstMat,
    /// Fastmem load of `width`, addressed as `[fastmem_base + guest_addr]`.
    MemLoad(Width),
    /// Fastmem store of `width`.
    MemStore(Width),
    /// Read from the guest-context register file.
    GuestRegLoad,
    /// Write to the guest-context register file.
    GuestRegStore,
    /// Unconditional branch, direct (constant target, chainable) or
    /// indirect (runtime target).
    Branch { direct: bool },
    /// Two-way conditional branch, always to constant targets.
    BranchCond,
    /// Return to the dispatcher.
    Return,
    /// Call into a slowmem thunk or MMIO callback.
    CallExternal,
    /// No code: reordering barrier only.
    Barrier,
    /// No code: a pass eliminated this instruction.
    Nop,
}

fn operand_is_const(instrs: &[Instruction], id: ValueId) -> bool {
    instrs
        .iter()
        .find(|i| i.dest == Some(id))
        .is_some_and(|i| i.opcode == Opcode::ConstI64)
}

/// Selects the lowering template for `instrs[idx]`.
#[must_use]
pub fn select(instrs: &[Instruction], idx: usize) -> Template {
    let instr = &instrs[idx];
    match instr.opcode {
        Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor => Template::BinOpReg,
        Opcode::Shl | Opcode::Shr | Opcode::Sar => {
            let imm = instr.operand1().is_some_and(|op| operand_is_const(instrs, op));
            if imm {
                Template::ShiftImm
            } else {
                Template::ShiftReg
            }
        }
        Opcode::Icmp(cond) => Template::Cmp(cond),
        Opcode::Bitcast | Opcode::ZeroExtend | Opcode::SignExtend | Opcode::Truncate => Template::Move,
        Opcode::ConstI64 => Template::ConstMat,
        Opcode::Load8 => Template::MemLoad(Width::W8),
        Opcode::Load16 => Template::MemLoad(Width::W16),
        Opcode::Load32 => Template::MemLoad(Width::W32),
        Opcode::Load64 => Template::MemLoad(Width::W64),
        Opcode::Store8 => Template::MemStore(Width::W8),
        Opcode::Store16 => Template::MemStore(Width::W16),
        Opcode::Store32 => Template::MemStore(Width::W32),
        Opcode::Store64 => Template::MemStore(Width::W64),
        Opcode::LoadGuestReg => Template::GuestRegLoad,
        Opcode::StoreGuestReg => Template::GuestRegStore,
        Opcode::Branch => {
            let direct = instr.operand0().is_some_and(|op| operand_is_const(instrs, op));
            Template::Branch { direct }
        }
        Opcode::BranchCond => Template::BranchCond,
        Opcode::Return => Template::Return,
        Opcode::CallExternal => Template::CallExternal,
        Opcode::Barrier => Template::Barrier,
        Opcode::Nop => Template::Nop,
    }
}
