//! The x86_64 byte encoder.
//!
//! Every integer value lives in a full 64-bit GPR (`REX.W` set on every
//! opcode below), so the encoder never needs an operand-size byte prefix.
//! Memory operands always use the `[base + index*1 + disp8(0)]` SIB form,
//! which sidesteps the `RSP`/`RBP`-as-base special cases entirely since
//! `disp8` is always present.

use crate::backend::registers::Reg;
use crate::common::{HostAddr, Width};
use crate::ir::opcode::ICmpCond;

/// Condition code nibble used by both `Jcc` and `SETcc`.
fn cc_code(cond: ICmpCond) -> u8 {
    match cond {
        ICmpCond::Eq => 0x4,
        ICmpCond::Ne => 0x5,
        ICmpCond::Ult => 0x2,
        ICmpCond::Ule => 0x6,
        ICmpCond::Slt => 0xC,
        ICmpCond::Sle => 0xE,
    }
}

fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | (u8::from(w) << 3) | (u8::from(r) << 2) | (u8::from(x) << 1) | u8::from(b)
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// A growable byte buffer for one block's machine code, with helpers for
/// every template [`crate::backend::lowering::Template`] needs.
#[derive(Default)]
pub struct X64Asm {
    code: Vec<u8>,
}

impl X64Asm {
    /// Creates an empty assembler buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    /// Current length of the emitted code, i.e. the byte offset the next
    /// instruction will start at.
    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Returns `true` if nothing has been emitted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Consumes the assembler, returning the finished byte buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }

    fn push(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn push_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn push_i64(&mut self, value: i64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// `mov dst, src` (`REX.W 89 /r`).
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        if dst == src {
            return;
        }
        self.push(rex(true, src.needs_rex_bit(), false, dst.needs_rex_bit()));
        self.push(0x89);
        self.push(modrm(0b11, src.low3(), dst.low3()));
    }

    /// `movabs dst, imm64` (`REX.W B8+r imm64`).
    pub fn mov_imm64(&mut self, dst: Reg, imm: i64) {
        self.push(rex(true, false, false, dst.needs_rex_bit()));
        self.push(0xB8 + dst.low3());
        self.push_i64(imm);
    }

    /// Two-address `op dst, src` where `dst` is both an input and the
    /// output (`dst := dst <op> src`). `opcode` is the `/r` add/sub/and/
    /// or/xor r/m64,r64 byte.
    fn binop(&mut self, opcode: u8, dst: Reg, src: Reg) {
        self.push(rex(true, src.needs_rex_bit(), false, dst.needs_rex_bit()));
        self.push(opcode);
        self.push(modrm(0b11, src.low3(), dst.low3()));
    }

    /// `dst := dst + src`.
    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.binop(0x01, dst, src);
    }
    /// `dst := dst - src`.
    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.binop(0x29, dst, src);
    }
    /// `dst := dst & src`.
    pub fn and_rr(&mut self, dst: Reg, src: Reg) {
        self.binop(0x21, dst, src);
    }
    /// `dst := dst | src`.
    pub fn or_rr(&mut self, dst: Reg, src: Reg) {
        self.binop(0x09, dst, src);
    }
    /// `dst := dst ^ src`.
    pub fn xor_rr(&mut self, dst: Reg, src: Reg) {
        self.binop(0x31, dst, src);
    }
    /// `cmp dst, src` (flags only).
    pub fn cmp_rr(&mut self, dst: Reg, src: Reg) {
        self.binop(0x39, dst, src);
    }

    fn shift_group(&mut self, group_ext: u8, opcode: u8, dst: Reg, imm8: Option<u8>) {
        self.push(rex(true, false, false, dst.needs_rex_bit()));
        self.push(opcode);
        self.push(modrm(0b11, group_ext, dst.low3()));
        if let Some(imm) = imm8 {
            self.push(imm);
        }
    }

    /// `dst := dst << imm8` (`REX.W C1 /4 ib`).
    pub fn shl_imm(&mut self, dst: Reg, imm8: u8) {
        self.shift_group(4, 0xC1, dst, Some(imm8));
    }
    /// `dst := dst >> imm8`, logical.
    pub fn shr_imm(&mut self, dst: Reg, imm8: u8) {
        self.shift_group(5, 0xC1, dst, Some(imm8));
    }
    /// `dst := dst >> imm8`, arithmetic.
    pub fn sar_imm(&mut self, dst: Reg, imm8: u8) {
        self.shift_group(7, 0xC1, dst, Some(imm8));
    }
    /// `dst := dst << cl` (`REX.W D3 /4`). The shift count must already be
    /// in `CL` ([`crate::backend::registers::TMP1`]'s low byte).
    pub fn shl_cl(&mut self, dst: Reg) {
        self.shift_group(4, 0xD3, dst, None);
    }
    /// `dst := dst >> cl`, logical.
    pub fn shr_cl(&mut self, dst: Reg) {
        self.shift_group(5, 0xD3, dst, None);
    }
    /// `dst := dst >> cl`, arithmetic.
    pub fn sar_cl(&mut self, dst: Reg) {
        self.shift_group(7, 0xD3, dst, None);
    }

    /// `setcc dst8` then zero-extends `dst8` into `dst` (`0F 9x /0`, then
    /// `REX.W 0F B6 /r`). Always prefixes `SETcc` with a (possibly
    /// bit-empty) REX so `dst`'s low byte is addressed uniformly even for
    /// `RSI`/`RDI`/`RBP`/`RSP`-numbered registers.
    pub fn setcc_zx(&mut self, cond: ICmpCond, dst: Reg) {
        self.push(rex(false, false, false, dst.needs_rex_bit()));
        self.push(0x0F);
        self.push(0x90 + cc_code(cond));
        self.push(modrm(0b11, 0, dst.low3()));
        self.push(rex(true, dst.needs_rex_bit(), false, dst.needs_rex_bit()));
        self.push(0x0F);
        self.push(0xB6);
        self.push(modrm(0b11, dst.low3(), dst.low3()));
    }

    /// Loads `width` bytes from `[base + index*1 + 0]` into `dst`, zero- or
    /// sign-extending to 64 bits (`movzx`/`movsx`/`mov`). Returns the byte
    /// offset the instruction started at, for the block's fastmem site
    /// table.
    pub fn load_mem(&mut self, width: Width, dst: Reg, base: Reg, index: Reg, signed: bool) -> usize {
        let start = self.len();
        match (width, signed) {
            (Width::W8, false) => self.movzx_sib(0xB6, dst, base, index),
            (Width::W8, true) => self.movsx_sib(0xBE, dst, base, index),
            (Width::W16, false) => self.movzx_sib(0xB7, dst, base, index),
            (Width::W16, true) => self.movsx_sib(0xBF, dst, base, index),
            (Width::W32, false) => self.mov32_zx_sib(dst, base, index),
            (Width::W32, true) => self.movsxd_sib(dst, base, index),
            (Width::W64, _) => self.mov64_sib(dst, base, index, true),
        }
        start
    }

    /// Stores the low `width` bytes of `src` to `[base + index*1 + 0]`.
    /// Returns the byte offset the instruction started at.
    pub fn store_mem(&mut self, width: Width, base: Reg, index: Reg, src: Reg) -> usize {
        let start = self.len();
        match width {
            Width::W8 => {
                self.push(rex(false, src.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit()));
                self.push(0x88);
                self.sib_operand(src.low3(), base, index);
            }
            Width::W16 => {
                self.push(0x66); // operand-size override
                self.push(rex(false, src.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit()));
                self.push(0x89);
                self.sib_operand(src.low3(), base, index);
            }
            Width::W32 => {
                self.push(rex(false, src.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit()));
                self.push(0x89);
                self.sib_operand(src.low3(), base, index);
            }
            Width::W64 => self.mov64_sib(src, base, index, false),
        }
        start
    }

    /// Emits the ModRM (+ SIB if `base` requires it) and `disp32` for a
    /// `[base + disp32]` operand, without an index register. Used for the
    /// guest-context register file and spill slots, both addressed off
    /// [`crate::backend::registers::CONTEXT`].
    fn mem_disp32_operand(&mut self, reg_field: u8, base: Reg, disp: i32) {
        self.push(modrm(0b10, reg_field, base.low3()));
        if base.low3() == 0b100 {
            // RSP/R12 as a base always needs a SIB byte, scale/index unused.
            self.push(0x24);
        }
        self.push_u32(disp as u32);
    }

    /// `mov dst, [base + disp32]`, full 64-bit load.
    pub fn load_disp32(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.push(rex(true, dst.needs_rex_bit(), false, base.needs_rex_bit()));
        self.push(0x8B);
        self.mem_disp32_operand(dst.low3(), base, disp);
    }

    /// `mov [base + disp32], src`, full 64-bit store.
    pub fn store_disp32(&mut self, base: Reg, disp: i32, src: Reg) {
        self.push(rex(true, src.needs_rex_bit(), false, base.needs_rex_bit()));
        self.push(0x89);
        self.mem_disp32_operand(src.low3(), base, disp);
    }

    fn sib_operand(&mut self, reg_field: u8, base: Reg, index: Reg) {
        self.push(modrm(0b01, reg_field, 0b100));
        self.push((0 << 6) | (index.low3() << 3) | base.low3());
        self.push(0); // disp8 = 0
    }

    fn movzx_sib(&mut self, opcode_low: u8, dst: Reg, base: Reg, index: Reg) {
        self.push(rex(true, dst.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit()));
        self.push(0x0F);
        self.push(opcode_low);
        self.sib_operand(dst.low3(), base, index);
    }

    fn movsx_sib(&mut self, opcode_low: u8, dst: Reg, base: Reg, index: Reg) {
        self.movzx_sib(opcode_low, dst, base, index);
    }

    fn mov32_zx_sib(&mut self, dst: Reg, base: Reg, index: Reg) {
        // A plain 32-bit `mov` zero-extends into the full 64-bit register
        // on x86_64; no REX.W needed for the load itself.
        self.push(rex(false, dst.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit()));
        self.push(0x8B);
        self.sib_operand(dst.low3(), base, index);
    }

    fn movsxd_sib(&mut self, dst: Reg, base: Reg, index: Reg) {
        self.push(rex(true, dst.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit()));
        self.push(0x63);
        self.sib_operand(dst.low3(), base, index);
    }

    fn mov64_sib(&mut self, reg: Reg, base: Reg, index: Reg, load: bool) {
        self.push(rex(true, reg.needs_rex_bit(), index.needs_rex_bit(), base.needs_rex_bit()));
        self.push(if load { 0x8B } else { 0x89 });
        self.sib_operand(reg.low3(), base, index);
    }

    /// `call rax` after loading `target` into `RAX` — the emitter reserves
    /// `RAX` ([`crate::backend::registers::TMP0`]) for exactly this use
    /// around external calls.
    pub fn call_abs(&mut self, target: HostAddr) {
        self.mov_imm64(Reg::Rax, target.val() as i64);
        self.push(rex(true, false, false, false));
        self.push(0xFF);
        self.push(modrm(0b11, 2, Reg::Rax.low3()));
    }

    /// Emits `jmp rel32` with a zeroed placeholder displacement, returning
    /// the byte offset of the 4-byte immediate for later patching (block
    /// chaining or a not-yet-resident target).
    pub fn jmp_rel32_placeholder(&mut self) -> usize {
        self.push(0xE9);
        let at = self.len();
        self.push_u32(0);
        at
    }

    /// Emits `jcc rel32` (two-byte opcode form) with a zeroed placeholder
    /// displacement, returning the immediate's byte offset.
    pub fn jcc_rel32_placeholder(&mut self, cond: ICmpCond) -> usize {
        self.push(0x0F);
        self.push(0x80 + cc_code(cond));
        let at = self.len();
        self.push_u32(0);
        at
    }

    /// Patches a previously emitted `rel32` at byte offset `imm_offset` (as
    /// returned by the `*_placeholder` methods) so it targets `target`,
    /// given the absolute address the *next* instruction after it will have
    /// (`next_instr_addr`).
    pub fn patch_rel32(buf: &mut [u8], imm_offset: usize, target: HostAddr, next_instr_addr: HostAddr) {
        let rel = target.val() as i64 - next_instr_addr.val() as i64;
        let rel = i32::try_from(rel).expect("chained block out of 32-bit relative range");
        buf[imm_offset..imm_offset + 4].copy_from_slice(&rel.to_le_bytes());
    }

    /// Patches a previously emitted placeholder `rel32` at `imm_offset`
    /// (still inside this in-progress buffer) to `rel` — for intra-block
    /// jumps whose target offset, e.g. this block's own epilogue, is
    /// already known before the buffer is finalized.
    pub fn patch_local(&mut self, imm_offset: usize, rel: i32) {
        self.code[imm_offset..imm_offset + 4].copy_from_slice(&rel.to_le_bytes());
    }

    /// `push r64`. `REX.B` only, if `r` needs it — `push`/`pop` have no
    /// 32/64-bit distinction on x86_64 (always 8 bytes), so `REX.W` is
    /// never set here.
    pub fn push_reg(&mut self, r: Reg) {
        if r.needs_rex_bit() {
            self.push(rex(false, false, false, true));
        }
        self.push(0x50 + r.low3());
    }

    /// `pop r64`.
    pub fn pop_reg(&mut self, r: Reg) {
        if r.needs_rex_bit() {
            self.push(rex(false, false, false, true));
        }
        self.push(0x58 + r.low3());
    }

    /// `test dst, src` (flags only; `ZF` set iff `dst & src == 0`).
    pub fn test_rr(&mut self, dst: Reg, src: Reg) {
        self.push(rex(true, src.needs_rex_bit(), false, dst.needs_rex_bit()));
        self.push(0x85);
        self.push(modrm(0b11, src.low3(), dst.low3()));
    }

    /// 32-bit `mov dst, [base + disp32]`, zero-extended into the full
    /// 64-bit register. Used for the rare case of reading a 32-bit context
    /// field.
    pub fn load_disp32_w32_zx(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.push(rex(false, dst.needs_rex_bit(), false, base.needs_rex_bit()));
        self.push(0x8B);
        self.mem_disp32_operand(dst.low3(), base, disp);
    }

    /// 32-bit `mov [base + disp32], src`. Used for the guest-context `pc`
    /// field, which is `u32`, not a full 64-bit slot.
    pub fn store_disp32_w32(&mut self, base: Reg, disp: i32, src: Reg) {
        self.push(rex(false, src.needs_rex_bit(), false, base.needs_rex_bit()));
        self.push(0x89);
        self.mem_disp32_operand(src.low3(), base, disp);
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.push(0xC3);
    }

    /// `nop`, used to pad a fastmem site out to its reserved patch length.
    pub fn nop(&mut self) {
        self.push(0x90);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rr_encodes_rex_w() {
        let mut asm = X64Asm::new();
        asm.add_rr(Reg::Rbx, Reg::R8);
        let bytes = asm.into_bytes();
        assert_eq!(bytes[0] & 0xF0, 0x40);
        assert_ne!(bytes[0] & 0x08, 0, "REX.W must be set");
        assert_eq!(bytes[1], 0x01);
    }

    #[test]
    fn jmp_placeholder_then_patch() {
        let mut asm = X64Asm::new();
        asm.nop();
        let at = asm.jmp_rel32_placeholder();
        let mut code = asm.into_bytes();
        let base = HostAddr(0x1000);
        let next = HostAddr(base.val() + code.len());
        X64Asm::patch_rel32(&mut code, at, HostAddr(0x2000), next);
        let rel = i32::from_le_bytes(code[at..at + 4].try_into().unwrap());
        assert_eq!(rel, 0x2000 - next.val() as i64 as i32);
    }
}
