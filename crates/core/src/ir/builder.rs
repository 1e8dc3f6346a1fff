//! `IRBuilder`: constructs well-typed SSA for one block.
//!
//! Values and instructions live in plain `Vec`s scoped to a single block
//! compilation — the bump arena the design calls for, freed wholesale when
//! the builder is dropped after the block is handed to the backend.

use crate::common::{JitError, JitResult};
use crate::ir::instr::Instruction;
use crate::ir::opcode::Opcode;
use crate::ir::types::IrType;
use crate::ir::value::{InstrId, ValueId, ValueInfo, VOID_VALUE};

/// Packs two guest PCs into one immediate, for [`IRBuilder::branch_cond`].
#[must_use]
pub const fn pack_targets(true_pc: u32, false_pc: u32) -> i64 {
    ((true_pc as i64) << 32) | (false_pc as i64)
}

/// Unpacks the immediate [`IRBuilder::branch_cond`] produced back into
/// `(true_pc, false_pc)`.
#[must_use]
pub const fn unpack_targets(imm: i64) -> (u32, u32) {
    ((imm >> 32) as u32, imm as u32)
}

/// Maps an opcode to a stable `&'static str` name for
/// [`crate::common::JitError::IrTypeError`], independent of `Icmp`'s nested
/// `ICmpCond` (which makes `Opcode`'s own `Debug` output not `'static`).
const fn opcode_name(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::Add => "Add",
        Opcode::Sub => "Sub",
        Opcode::And => "And",
        Opcode::Or => "Or",
        Opcode::Xor => "Xor",
        Opcode::Shl => "Shl",
        Opcode::Shr => "Shr",
        Opcode::Sar => "Sar",
        Opcode::Icmp(_) => "Icmp",
        Opcode::ZeroExtend => "ZeroExtend",
        Opcode::SignExtend => "SignExtend",
        Opcode::Truncate => "Truncate",
        Opcode::Bitcast => "Bitcast",
        Opcode::Load8 => "Load8",
        Opcode::Load16 => "Load16",
        Opcode::Load32 => "Load32",
        Opcode::Load64 => "Load64",
        Opcode::Store8 => "Store8",
        Opcode::Store16 => "Store16",
        Opcode::Store32 => "Store32",
        Opcode::Store64 => "Store64",
        Opcode::LoadGuestReg => "LoadGuestReg",
        Opcode::StoreGuestReg => "StoreGuestReg",
        Opcode::Branch => "Branch",
        Opcode::BranchCond => "BranchCond",
        Opcode::Return => "Return",
        Opcode::CallExternal => "CallExternal",
        Opcode::Barrier => "Barrier",
        Opcode::ConstI64 => "ConstI64",
        Opcode::Nop => "Nop",
    }
}

/// Builds one block's worth of SSA IR.
pub struct IRBuilder {
    values: Vec<ValueInfo>,
    instructions: Vec<Instruction>,
    terminated: bool,
}

impl IRBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            instructions: Vec::new(),
            terminated: false,
        }
    }

    /// Reserves a fresh value id of the given type, with no producer yet.
    /// Low-level primitive; most callers go through [`Self::emit`] instead.
    fn new_value(&mut self, ty: IrType, producer: InstrId) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueInfo { ty, producer });
        id
    }

    /// Returns the type of a previously emitted value.
    #[must_use]
    pub fn value_type(&self, id: ValueId) -> IrType {
        self.values[id.0 as usize].ty
    }

    /// Returns the instruction that defines `id`.
    #[must_use]
    pub fn producer(&self, id: ValueId) -> &Instruction {
        let producer = self.values[id.0 as usize].producer;
        &self.instructions[producer.0 as usize]
    }

    /// Enforces operand-arity and type compatibility per opcode, the
    /// contract every IR consumer (lowering, register allocation, the
    /// simplification pass) relies on holding by construction. A violation
    /// is logged and then panics, carrying the same [`JitError::IrTypeError`]
    /// used for the missing-terminator case in [`Self::finish`] — both are
    /// frontend/compiler bugs, not conditions a caller could recover from.
    fn check_contract(&self, opcode: Opcode, operands: &[ValueId], dest_ty: Option<IrType>) {
        let ty = |id: ValueId| self.value_type(id);
        let mut detail = None;

        let binop_like = matches!(
            opcode,
            Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr | Opcode::Sar
        );

        if binop_like || matches!(opcode, Opcode::Icmp(_)) {
            if operands.len() != 2 {
                detail = Some(format!("expected 2 operands, got {}", operands.len()));
            } else {
                let (a, b) = (ty(operands[0]), ty(operands[1]));
                if !a.is_integer() || !b.is_integer() {
                    detail = Some(format!("requires integer operands, got {a:?} and {b:?}"));
                } else if a != b {
                    detail = Some(format!("operand type mismatch: {a:?} vs {b:?}"));
                } else if binop_like && dest_ty != Some(a) {
                    detail = Some(format!("dest type {dest_ty:?} must match operand type {a:?}"));
                } else if matches!(opcode, Opcode::Icmp(_)) && dest_ty.is_none() {
                    detail = Some("must produce a value".to_string());
                }
            }
        } else if matches!(opcode, Opcode::ZeroExtend | Opcode::SignExtend | Opcode::Truncate) {
            if operands.len() != 1 {
                detail = Some(format!("expected 1 operand, got {}", operands.len()));
            } else {
                let src = ty(operands[0]);
                match dest_ty {
                    None => detail = Some("must produce a value".to_string()),
                    Some(dst) if !src.is_integer() || !dst.is_integer() => {
                        detail = Some(format!("requires integer operand and dest, got {src:?} -> {dst:?}"));
                    }
                    Some(dst) if opcode == Opcode::Truncate && dst.bits() >= src.bits() => {
                        detail = Some(format!("Truncate requires a narrower dest than {src:?}, got {dst:?}"));
                    }
                    Some(dst) if opcode != Opcode::Truncate && dst.bits() <= src.bits() => {
                        detail = Some(format!("requires a wider dest than {src:?}, got {dst:?}"));
                    }
                    Some(_) => {}
                }
            }
        } else if opcode == Opcode::Bitcast {
            if operands.len() != 1 {
                detail = Some(format!("expected 1 operand, got {}", operands.len()));
            } else {
                let src = ty(operands[0]);
                match dest_ty {
                    None => detail = Some("must produce a value".to_string()),
                    Some(dst) if dst.bits() != src.bits() => {
                        detail = Some(format!("requires a same-width dest as {src:?}, got {dst:?}"));
                    }
                    Some(_) => {}
                }
            }
        } else if opcode.is_memory() {
            let is_store = matches!(opcode, Opcode::Store8 | Opcode::Store16 | Opcode::Store32 | Opcode::Store64);
            let expected_operands = if is_store { 2 } else { 1 };
            if operands.len() != expected_operands {
                detail = Some(format!("expected {expected_operands} operands, got {}", operands.len()));
            } else if !ty(operands[0]).is_integer() {
                detail = Some(format!("address operand must be an integer, got {:?}", ty(operands[0])));
            } else if is_store && !ty(operands[1]).is_integer() {
                detail = Some(format!("stored value must be an integer, got {:?}", ty(operands[1])));
            } else if is_store && dest_ty.is_some() {
                detail = Some("must not produce a value".to_string());
            } else if !is_store && dest_ty != Some(IrType::I64) {
                detail = Some(format!("always produces I64, got {dest_ty:?}"));
            }
        } else {
            match opcode {
                Opcode::LoadGuestReg => {
                    if !operands.is_empty() {
                        detail = Some(format!("expected 0 operands, got {}", operands.len()));
                    } else if dest_ty.is_none() {
                        detail = Some("must produce a value".to_string());
                    }
                }
                Opcode::StoreGuestReg => {
                    if operands.len() != 1 {
                        detail = Some(format!("expected 1 operand, got {}", operands.len()));
                    } else if dest_ty.is_some() {
                        detail = Some("must not produce a value".to_string());
                    }
                }
                Opcode::Branch => {
                    if operands.len() != 1 {
                        detail = Some(format!("expected 1 operand, got {}", operands.len()));
                    } else if dest_ty.is_some() {
                        detail = Some("must not produce a value".to_string());
                    }
                }
                Opcode::BranchCond => {
                    if operands.len() != 1 {
                        detail = Some(format!("expected 1 operand, got {}", operands.len()));
                    } else if !ty(operands[0]).is_integer() {
                        detail = Some(format!("condition operand must be an integer, got {:?}", ty(operands[0])));
                    } else if dest_ty.is_some() {
                        detail = Some("must not produce a value".to_string());
                    }
                }
                Opcode::Return | Opcode::Barrier => {
                    if !operands.is_empty() {
                        detail = Some(format!("expected 0 operands, got {}", operands.len()));
                    } else if dest_ty.is_some() {
                        detail = Some("must not produce a value".to_string());
                    }
                }
                Opcode::CallExternal => {
                    if operands.len() > 3 {
                        detail = Some(format!("at most 3 arguments, got {}", operands.len()));
                    }
                }
                Opcode::ConstI64 => {
                    if !operands.is_empty() {
                        detail = Some(format!("expected 0 operands, got {}", operands.len()));
                    } else if dest_ty.is_none() {
                        detail = Some("must produce a value".to_string());
                    }
                }
                // `Nop` is only ever produced in place by
                // `ir::passes::dead_store_eliminate`, never through `emit`;
                // no contract to enforce here.
                Opcode::Nop => {}
                _ => unreachable!("opcode {opcode:?} not covered by check_contract's dispatch"),
            }
        }

        if let Some(detail) = detail {
            let err = JitError::IrTypeError { opcode: opcode_name(opcode), detail };
            tracing::error!(error = %err, "IR builder contract violation");
            panic!("{err}");
        }
    }

    /// Appends an instruction. `dest_ty` is `Some` for opcodes that define a
    /// value; the returned `ValueId` is [`VOID_VALUE`] otherwise.
    ///
    /// # Panics
    ///
    /// Panics if called after a terminator has already been emitted — every
    /// block has exactly one terminator, as its last instruction. Also
    /// panics if `operands`/`dest_ty` are incompatible with `opcode`'s
    /// contract (see [`Self::check_contract`]) — a frontend/compiler bug,
    /// not a guest-level condition, so it is fatal rather than a `Result`
    /// every caller would have to thread through.
    pub fn emit(
        &mut self,
        opcode: Opcode,
        operands: &[ValueId],
        imm: Option<i64>,
        dest_ty: Option<IrType>,
    ) -> ValueId {
        assert!(
            !self.terminated,
            "IRBuilder::emit called after a terminator was already appended"
        );
        self.check_contract(opcode, operands, dest_ty);

        let mut packed = [None; 3];
        for (slot, value) in packed.iter_mut().zip(operands) {
            *slot = Some(*value);
        }

        let instr_id = InstrId(self.instructions.len() as u32);
        let dest = dest_ty.map(|ty| self.new_value(ty, instr_id));

        self.instructions.push(Instruction {
            opcode,
            operands: packed,
            imm,
            dest,
        });

        if opcode.is_terminator() {
            self.terminated = true;
        }

        dest.unwrap_or(VOID_VALUE)
    }

    /// Materializes a constant of the given type.
    pub fn const_value(&mut self, value: i64, ty: IrType) -> ValueId {
        self.emit(Opcode::ConstI64, &[], Some(value), Some(ty))
    }

    /// Loads a guest register. The first use in a block materializes a real
    /// `LoadGuestReg`; callers are expected to reuse the returned value for
    /// subsequent uses within the same block rather than reloading.
    pub fn load_guest_reg(&mut self, reg_id: u16, ty: IrType) -> ValueId {
        self.emit(Opcode::LoadGuestReg, &[], Some(i64::from(reg_id)), Some(ty))
    }

    /// Stores to a guest register. Only the last store to a given register
    /// in a block need survive to the epilogue; earlier ones are cleaned up
    /// by [`crate::ir::passes::simplify`]'s dead-store elimination.
    pub fn store_guest_reg(&mut self, reg_id: u16, value: ValueId) {
        self.emit(Opcode::StoreGuestReg, &[value], Some(i64::from(reg_id)), None);
    }

    /// Terminates the block with a branch to `target`'s guest PC. If
    /// `target`'s producer is a `ConstI64`, the backend treats this as a
    /// direct, chainable branch; otherwise as an indirect dispatch.
    pub fn branch(&mut self, target: ValueId) {
        self.emit(Opcode::Branch, &[target], None, None);
    }

    /// Terminates the block with a two-way conditional branch. Both targets
    /// are constant guest PCs, packed into the instruction's single
    /// immediate slot via [`pack_targets`].
    pub fn branch_cond(&mut self, cond: ValueId, true_pc: u32, false_pc: u32) {
        self.emit(
            Opcode::BranchCond,
            &[cond],
            Some(pack_targets(true_pc, false_pc)),
            None,
        );
    }

    /// Loads `width` bytes from guest address `addr` (fastmem-addressed as
    /// `[fastmem_base + addr]` by the backend), zero-extended to a full
    /// 64-bit value.
    pub fn load_mem(&mut self, width: crate::common::Width, addr: ValueId) -> ValueId {
        let opcode = match width {
            crate::common::Width::W8 => Opcode::Load8,
            crate::common::Width::W16 => Opcode::Load16,
            crate::common::Width::W32 => Opcode::Load32,
            crate::common::Width::W64 => Opcode::Load64,
        };
        self.emit(opcode, &[addr], None, Some(IrType::I64))
    }

    /// Stores the low `width` bytes of `value` to guest address `addr`.
    pub fn store_mem(&mut self, width: crate::common::Width, addr: ValueId, value: ValueId) {
        let opcode = match width {
            crate::common::Width::W8 => Opcode::Store8,
            crate::common::Width::W16 => Opcode::Store16,
            crate::common::Width::W32 => Opcode::Store32,
            crate::common::Width::W64 => Opcode::Store64,
        };
        self.emit(opcode, &[addr, value], None, None);
    }

    /// Calls an external host function (the interpreter fallback or a
    /// diagnostic hook) with `args` passed in the System V integer argument
    /// registers after the implicit guest-context pointer. `target` is the
    /// host address of an `extern "C" fn(*mut GuestContext, ...)`, packed
    /// into the instruction's immediate slot since it is always a
    /// compile-time constant.
    pub fn call_external(&mut self, target: usize, args: &[ValueId], dest_ty: Option<IrType>) -> ValueId {
        self.emit(Opcode::CallExternal, args, Some(target as i64), dest_ty)
    }

    /// Terminates the block by returning control to the dispatcher. The
    /// guest PC must already have been written via `store_guest_reg` to the
    /// context's PC slot before this is called.
    pub fn return_to_dispatcher(&mut self) {
        self.emit(Opcode::Return, &[], None, None);
    }

    /// Consumes the builder, validating its invariants and returning the
    /// finished instruction list.
    ///
    /// # Errors
    ///
    /// Returns [`JitError::IrTypeError`] if no terminator was ever emitted —
    /// a frontend bug, since every code path through the frontend must
    /// reach a terminator before handing the block to the backend.
    pub fn finish(self) -> JitResult<Vec<Instruction>> {
        if !self.terminated {
            return Err(JitError::IrTypeError {
                opcode: "<block>",
                detail: "block has no terminator".to_string(),
            });
        }
        Ok(self.instructions)
    }
}

impl Default for IRBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_line_block_has_one_terminator_at_the_end() {
        let mut b = IRBuilder::new();
        let r2 = b.load_guest_reg(2, IrType::I64);
        let r3 = b.load_guest_reg(3, IrType::I64);
        let r1 = b.emit(Opcode::Add, &[r2, r3], None, Some(IrType::I64));
        b.store_guest_reg(1, r1);
        let two = b.const_value(2, IrType::I64);
        let r2b = b.emit(Opcode::Shl, &[r1, two], None, Some(IrType::I64));
        b.store_guest_reg(2, r2b);
        b.branch(r2b);

        let instrs = b.finish().unwrap();
        assert!(instrs.last().unwrap().opcode.is_terminator());
    }

    #[test]
    #[should_panic(expected = "after a terminator")]
    fn emit_after_terminator_panics() {
        let mut b = IRBuilder::new();
        b.return_to_dispatcher();
        b.const_value(1, IrType::I64);
    }

    #[test]
    fn pack_unpack_round_trips() {
        let imm = pack_targets(0x1000, 0x2000);
        assert_eq!(unpack_targets(imm), (0x1000, 0x2000));
    }

    #[test]
    #[should_panic(expected = "expected 2 operands")]
    fn binop_with_wrong_arity_panics() {
        let mut b = IRBuilder::new();
        let a = b.const_value(1, IrType::I64);
        b.emit(Opcode::Add, &[a], None, Some(IrType::I64));
    }

    #[test]
    #[should_panic(expected = "operand type mismatch")]
    fn binop_with_mismatched_operand_types_panics() {
        let mut b = IRBuilder::new();
        let a = b.const_value(1, IrType::I64);
        let narrow = b.emit(Opcode::Truncate, &[a], None, Some(IrType::I32));
        b.emit(Opcode::Add, &[a, narrow], None, Some(IrType::I64));
    }

    #[test]
    #[should_panic(expected = "dest type")]
    fn binop_with_dest_type_not_matching_operands_panics() {
        let mut b = IRBuilder::new();
        let a = b.const_value(1, IrType::I64);
        let c = b.const_value(2, IrType::I64);
        b.emit(Opcode::Add, &[a, c], None, Some(IrType::I32));
    }

    #[test]
    fn zero_extend_to_a_wider_integer_is_accepted() {
        let mut b = IRBuilder::new();
        let a = b.const_value(1, IrType::I32);
        b.emit(Opcode::ZeroExtend, &[a], None, Some(IrType::I64));
    }

    #[test]
    #[should_panic(expected = "requires a wider dest")]
    fn zero_extend_to_a_narrower_integer_panics() {
        let mut b = IRBuilder::new();
        let a = b.const_value(1, IrType::I64);
        b.emit(Opcode::ZeroExtend, &[a], None, Some(IrType::I32));
    }

    #[test]
    #[should_panic(expected = "must not produce a value")]
    fn store_with_a_dest_type_panics() {
        let mut b = IRBuilder::new();
        let addr = b.const_value(0x1000, IrType::I64);
        let value = b.const_value(0x99, IrType::I64);
        b.emit(Opcode::Store32, &[addr, value], None, Some(IrType::I64));
    }

    #[test]
    #[should_panic(expected = "always produces I64")]
    fn load_with_a_non_i64_dest_panics() {
        let mut b = IRBuilder::new();
        let addr = b.const_value(0x1000, IrType::I64);
        b.emit(Opcode::Load32, &[addr], None, Some(IrType::I32));
    }
}
