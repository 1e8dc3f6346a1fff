//! The frontend: decodes guest instructions into simplified IR, one block
//! at a time (design §4.5).
//!
//! A block ends at the first of: an unconditional or conditional branch, a
//! software trap or unrecognized opcode (both routed to the interpreter
//! fallback), the configured maximum instruction count, or a guest
//! instruction that would cross a 4 KiB page boundary.

use crate::common::{GuestAddr, JitResult, Width};
use crate::dispatcher::interpreter_fallback;
use crate::ir::builder::IRBuilder;
use crate::ir::opcode::{ICmpCond, Opcode};
use crate::ir::types::IrType;
use crate::ir::{passes, Instruction};
use crate::isa::decode::{decode, Op};
use crate::isa::INSTR_LEN;
use crate::memory::AddressSpace;
use crate::stats::Stats;

/// One block's decoded, simplified IR plus the guest range it covers.
pub struct DecodedBlock {
    /// Lowest guest PC covered.
    pub pc_lo: GuestAddr,
    /// Exclusive upper bound of guest PCs covered.
    pub pc_hi: GuestAddr,
    /// The finished, simplified instruction list (one terminator, last).
    pub instructions: Vec<Instruction>,
}

/// Decodes and simplifies one block starting at `pc_lo`.
///
/// # Errors
///
/// Never fails on guest input — unrecognized opcodes route to the
/// interpreter fallback rather than erroring. Can still return
/// [`crate::common::JitError::IrTypeError`] if the builder's own
/// terminator invariant is violated, which would be a bug in this module.
pub fn decode_block(mem: &mut AddressSpace, pc_lo: GuestAddr, max_len: usize, stats: &mut Stats) -> JitResult<DecodedBlock> {
    let mut builder = IRBuilder::new();
    let mut pc = pc_lo;
    let start_page = pc_lo.page();

    for count in 0..max_len {
        let raw = mem.read16(pc);
        let decoded = decode(raw);
        let next_pc = pc.wrapping_add(INSTR_LEN);
        let crossing_page = next_pc.page() != start_page && count + 1 < max_len;

        match decoded.op {
            Op::Add | Op::Sub | Op::And | Op::Or | Op::Xor => {
                let a = builder.load_guest_reg(decoded.rs1 as u16, IrType::I64);
                let b = builder.load_guest_reg(decoded.rs2 as u16, IrType::I64);
                let opcode = match decoded.op {
                    Op::Add => Opcode::Add,
                    Op::Sub => Opcode::Sub,
                    Op::And => Opcode::And,
                    Op::Or => Opcode::Or,
                    _ => Opcode::Xor,
                };
                let r = builder.emit(opcode, &[a, b], None, Some(IrType::I64));
                builder.store_guest_reg(decoded.rd as u16, r);
            }
            Op::Slt | Op::Sltu => {
                let a = builder.load_guest_reg(decoded.rs1 as u16, IrType::I64);
                let b = builder.load_guest_reg(decoded.rs2 as u16, IrType::I64);
                let cond = if decoded.op == Op::Slt { ICmpCond::Slt } else { ICmpCond::Ult };
                let r = builder.emit(Opcode::Icmp(cond), &[a, b], None, Some(IrType::I64));
                builder.store_guest_reg(decoded.rd as u16, r);
            }
            Op::Addi => {
                let a = builder.load_guest_reg(decoded.rs1 as u16, IrType::I64);
                let imm = builder.const_value(i64::from(decoded.imm), IrType::I64);
                let r = builder.emit(Opcode::Add, &[a, imm], None, Some(IrType::I64));
                builder.store_guest_reg(decoded.rd as u16, r);
            }
            Op::Shli | Op::Shri => {
                let a = builder.load_guest_reg(decoded.rs1 as u16, IrType::I64);
                let imm = builder.const_value(i64::from(decoded.imm), IrType::I64);
                let opcode = if decoded.op == Op::Shli { Opcode::Shl } else { Opcode::Shr };
                let r = builder.emit(opcode, &[a, imm], None, Some(IrType::I64));
                builder.store_guest_reg(decoded.rd as u16, r);
            }
            Op::Load32 => {
                let addr = builder.load_guest_reg(decoded.rs1 as u16, IrType::I64);
                let v = builder.load_mem(Width::W32, addr);
                builder.store_guest_reg(decoded.rd as u16, v);
            }
            Op::Store32 => {
                let addr = builder.load_guest_reg(decoded.rs1 as u16, IrType::I64);
                let v = builder.load_guest_reg(decoded.rs2 as u16, IrType::I64);
                builder.store_mem(Width::W32, addr, v);
            }
            Op::Beq => {
                let a = builder.load_guest_reg(decoded.rs1 as u16, IrType::I64);
                let b = builder.load_guest_reg(decoded.rs2 as u16, IrType::I64);
                let cond = builder.emit(Opcode::Icmp(ICmpCond::Eq), &[a, b], None, Some(IrType::I64));
                let true_pc = next_pc.wrapping_add((decoded.imm * 2) as u32);
                builder.branch_cond(cond, true_pc.val(), next_pc.val());
                return finish(builder, pc_lo, next_pc);
            }
            Op::Bra => {
                let target = next_pc.wrapping_add((decoded.imm * 2) as u32);
                let target_value = builder.const_value(i64::from(target.val()), IrType::I64);
                builder.branch(target_value);
                return finish(builder, pc_lo, next_pc);
            }
            Op::Trap | Op::Unsupported => {
                if decoded.op == Op::Unsupported {
                    tracing::warn!(pc = pc.val(), raw = decoded.raw, "unsupported opcode, falling back to interpreter");
                }
                let pc_value = builder.const_value(i64::from(pc.val()), IrType::I64);
                let raw_value = builder.const_value(i64::from(decoded.raw), IrType::I64);
                builder.call_external(interpreter_fallback as usize, &[pc_value, raw_value], None);
                builder.return_to_dispatcher();
                stats.interpreter_fallbacks += 1;
                return finish(builder, pc_lo, next_pc);
            }
        }

        if crossing_page {
            let target_value = builder.const_value(i64::from(next_pc.val()), IrType::I64);
            builder.branch(target_value);
            return finish(builder, pc_lo, next_pc);
        }

        pc = next_pc;
    }

    // Hit `max_len` without a natural terminator: synthesize a fallthrough
    // branch so the block still ends in exactly one terminator.
    let target_value = builder.const_value(i64::from(pc.val()), IrType::I64);
    builder.branch(target_value);
    finish(builder, pc_lo, pc)
}

fn finish(builder: IRBuilder, pc_lo: GuestAddr, pc_hi: GuestAddr) -> JitResult<DecodedBlock> {
    let mut instructions = builder.finish()?;
    passes::simplify(&mut instructions);
    Ok(DecodedBlock { pc_lo, pc_hi, instructions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressSpaceConfig;

    fn mem_with(code: &[u16]) -> AddressSpace {
        let mut mem = AddressSpace::new(&AddressSpaceConfig::default());
        let mut bytes = Vec::with_capacity(code.len() * 2);
        for w in code {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        mem.map_ram(0x1000, 0x2000, &bytes).unwrap();
        mem
    }

    #[test]
    fn straight_line_then_synthesized_fallthrough_branch() {
        // add r1, r2, r3 ; add r1, r2, r3
        let add = (0x0u16 << 12) | (1 << 8) | (2 << 4) | 3;
        let mut mem = mem_with(&[add, add]);
        let mut stats = Stats::new();
        let block = decode_block(&mut mem, GuestAddr::new(0x1000), 2, &mut stats).unwrap();
        assert_eq!(block.pc_lo, GuestAddr::new(0x1000));
        assert_eq!(block.pc_hi, GuestAddr::new(0x1004));
        assert!(block.instructions.last().unwrap().opcode.is_terminator());
    }

    #[test]
    fn unconditional_branch_terminates_immediately() {
        // bra +0 (infinite loop to self)
        let bra = (0xDu16 << 12) | 0x0FFF; // imm12 = -1 -> target = next_pc - 2 = pc
        let mut mem = mem_with(&[bra]);
        let mut stats = Stats::new();
        let block = decode_block(&mut mem, GuestAddr::new(0x1000), 256, &mut stats).unwrap();
        assert_eq!(block.pc_hi, GuestAddr::new(0x1002));
        assert_eq!(block.instructions.len(), 2); // ConstI64 target, Branch
    }

    #[test]
    fn unsupported_opcode_falls_back_and_terminates() {
        let raw = 0xF000u16;
        let mut mem = mem_with(&[raw]);
        let mut stats = Stats::new();
        let block = decode_block(&mut mem, GuestAddr::new(0x1000), 256, &mut stats).unwrap();
        assert_eq!(stats.interpreter_fallbacks, 1);
        assert!(matches!(block.instructions.last().unwrap().opcode, Opcode::Return));
    }
}
