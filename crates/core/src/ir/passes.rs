//! The mandatory baseline simplification pass.
//!
//! Runs over a finished instruction list in place. Because operands are
//! `ValueId`s resolved through each value's producer instruction, folding or
//! aliasing an instruction in place automatically updates every later use —
//! no separate use-list rewrite is needed.

use std::collections::HashMap;

use crate::ir::instr::Instruction;
use crate::ir::opcode::{ICmpCond, Opcode};
use crate::ir::types::IrType;
use crate::ir::value::ValueId;

/// Runs constant folding, identity/zero simplification, dead-store
/// elimination of killed guest-register writes, and per-block GVN over
/// `instrs`, in that order.
pub fn simplify(instrs: &mut [Instruction]) {
    constant_fold(instrs);
    identity_simplify(instrs);
    dead_store_eliminate(instrs);
    gvn(instrs);
}

fn const_of(instrs: &[Instruction], v: ValueId) -> Option<i64> {
    let producer = &instrs[find_producer_index(instrs, v)?];
    (producer.opcode == Opcode::ConstI64).then(|| producer.imm.unwrap_or(0))
}

/// `ValueId`s are assigned in emission order, one per instruction that
/// defines a value; an instruction's own position is not the value's index,
/// so this walks to find whichever instruction has `dest == Some(v)`.
fn find_producer_index(instrs: &[Instruction], v: ValueId) -> Option<usize> {
    instrs.iter().position(|i| i.dest == Some(v))
}

fn fold_binop(opcode: Opcode, a: i64, b: i64) -> Option<i64> {
    match opcode {
        Opcode::Add => Some(a.wrapping_add(b)),
        Opcode::Sub => Some(a.wrapping_sub(b)),
        Opcode::And => Some(a & b),
        Opcode::Or => Some(a | b),
        Opcode::Xor => Some(a ^ b),
        Opcode::Shl => Some(a.wrapping_shl(b as u32)),
        Opcode::Shr => Some(((a as u64).wrapping_shr(b as u32)) as i64),
        Opcode::Sar => Some(a.wrapping_shr(b as u32)),
        Opcode::Icmp(cond) => Some(i64::from(match cond {
            ICmpCond::Eq => a == b,
            ICmpCond::Ne => a != b,
            ICmpCond::Slt => a < b,
            ICmpCond::Ult => (a as u64) < (b as u64),
            ICmpCond::Sle => a <= b,
            ICmpCond::Ule => (a as u64) <= (b as u64),
        })),
        _ => None,
    }
}

fn constant_fold(instrs: &mut [Instruction]) {
    for i in 0..instrs.len() {
        let opcode = instrs[i].opcode;
        let Some(a_id) = instrs[i].operand0() else { continue };
        let Some(b_id) = instrs[i].operand1() else { continue };
        let (Some(a), Some(b)) = (const_of(instrs, a_id), const_of(instrs, b_id)) else {
            continue;
        };
        if let Some(result) = fold_binop(opcode, a, b) {
            instrs[i].opcode = Opcode::ConstI64;
            instrs[i].operands = [None; 3];
            instrs[i].imm = Some(result);
        }
    }
}

fn identity_simplify(instrs: &mut [Instruction]) {
    for i in 0..instrs.len() {
        let opcode = instrs[i].opcode;
        let Some(a_id) = instrs[i].operand0() else { continue };
        let rhs = instrs[i].operand1().and_then(|id| const_of(instrs, id));

        let alias = match (opcode, rhs) {
            (Opcode::Add | Opcode::Sub | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr | Opcode::Sar, Some(0)) => {
                Some(a_id)
            }
            (Opcode::And, Some(-1)) => Some(a_id),
            _ => None,
        };

        if let Some(alias) = alias {
            instrs[i].opcode = Opcode::Bitcast;
            instrs[i].operands = [Some(alias), None, None];
            instrs[i].imm = None;
        } else if opcode == Opcode::And && rhs == Some(0) {
            instrs[i].opcode = Opcode::ConstI64;
            instrs[i].operands = [None; 3];
            instrs[i].imm = Some(0);
        }
    }
}

/// Kills a `StoreGuestReg` if a later store to the same register occurs with
/// no intervening `LoadGuestReg` of it, `CallExternal`, or `Barrier` (any of
/// which could observe the value before it is overwritten).
fn dead_store_eliminate(instrs: &mut [Instruction]) {
    let len = instrs.len();
    for i in 0..len {
        if instrs[i].opcode != Opcode::StoreGuestReg {
            continue;
        }
        let reg = instrs[i].imm;
        let mut dead = false;
        for later in instrs.iter().take(len).skip(i + 1) {
            match later.opcode {
                Opcode::LoadGuestReg if later.imm == reg => break,
                Opcode::CallExternal | Opcode::Barrier => break,
                Opcode::StoreGuestReg if later.imm == reg => {
                    dead = true;
                    break;
                }
                _ => {}
            }
        }
        if dead {
            instrs[i].opcode = Opcode::Nop;
            instrs[i].operands = [None; 3];
            instrs[i].imm = None;
        }
    }
}

/// Per-block GVN: a later pure instruction with the same opcode, operands,
/// and immediate as an earlier one is redundant; alias it to the earlier
/// value instead of recomputing it.
fn gvn(instrs: &mut [Instruction]) {
    let mut seen: HashMap<(Opcode, [Option<ValueId>; 3], Option<i64>), ValueId> = HashMap::new();
    for i in 0..instrs.len() {
        let instr = instrs[i];
        if !instr.opcode.is_pure() {
            continue;
        }
        let Some(dest) = instr.dest else { continue };
        let key = (instr.opcode, instr.operands, instr.imm);
        if let Some(&earlier) = seen.get(&key) {
            instrs[i].opcode = Opcode::Bitcast;
            instrs[i].operands = [Some(earlier), None, None];
            instrs[i].imm = None;
        } else {
            seen.insert(key, dest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::IRBuilder;

    #[test]
    fn folds_constant_arithmetic() {
        let mut b = IRBuilder::new();
        let two = b.const_value(2, IrType::I64);
        let three = b.const_value(3, IrType::I64);
        let sum = b.emit(Opcode::Add, &[two, three], None, Some(IrType::I64));
        b.store_guest_reg(0, sum);
        b.return_to_dispatcher();
        let mut instrs = b.finish().unwrap();
        simplify(&mut instrs);

        let sum_idx = find_producer_index(&instrs, sum).unwrap();
        assert_eq!(instrs[sum_idx].opcode, Opcode::ConstI64);
        assert_eq!(instrs[sum_idx].imm, Some(5));
    }

    #[test]
    fn eliminates_overwritten_guest_reg_store() {
        let mut b = IRBuilder::new();
        let one = b.const_value(1, IrType::I64);
        let two = b.const_value(2, IrType::I64);
        b.store_guest_reg(5, one);
        b.store_guest_reg(5, two);
        b.return_to_dispatcher();
        let mut instrs = b.finish().unwrap();
        simplify(&mut instrs);

        let stores: Vec<_> = instrs
            .iter()
            .filter(|i| i.opcode == Opcode::StoreGuestReg)
            .collect();
        assert_eq!(stores.len(), 1);
    }

    #[test]
    fn gvn_deduplicates_identical_pure_ops() {
        let mut b = IRBuilder::new();
        let r1 = b.load_guest_reg(1, IrType::I64);
        let r2 = b.load_guest_reg(2, IrType::I64);
        let a = b.emit(Opcode::Add, &[r1, r2], None, Some(IrType::I64));
        let b_dup = b.emit(Opcode::Add, &[r1, r2], None, Some(IrType::I64));
        b.store_guest_reg(3, a);
        b.store_guest_reg(4, b_dup);
        b.return_to_dispatcher();
        let mut instrs = b.finish().unwrap();
        simplify(&mut instrs);

        let dup_idx = find_producer_index(&instrs, b_dup).unwrap();
        assert_eq!(instrs[dup_idx].opcode, Opcode::Bitcast);
        assert_eq!(instrs[dup_idx].operands[0], Some(a));
    }
}
