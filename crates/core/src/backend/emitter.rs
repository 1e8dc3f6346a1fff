//! Ties instruction selection, register allocation, and the x64 encoder
//! together to assemble one block's machine code and install it into the
//! cache.
//!
//! Every block gets a standard prologue/epilogue (push the callee-saved
//! registers the allocator and `CONTEXT` use, load `CONTEXT` from the
//! System V first argument, pop them back before `ret`) so it can be called
//! directly as an `extern "C" fn(*mut GuestContext)` from the dispatcher.
//! Direct branches (constant target) jump to this same block's epilogue via
//! a self-relative `jmp`, patched in place once the epilogue's local offset
//! is known; a [`Relocation`] is also recorded so [`chain_relocations`] can
//! later re-point that same jump straight at the target block once it is
//! resident, skipping the dispatcher round-trip entirely.

use crate::backend::lowering::{select, Template};
use crate::backend::regalloc::{self, Location};
use crate::backend::registers::{Reg, ARG_REGS, CONTEXT, TMP0, TMP1};
use crate::backend::thunks::ThunkTable;
use crate::backend::x64::X64Asm;
use crate::block::{FastmemSite, Relocation, FASTMEM_SITE_LEN};
use crate::cache::{BlockCache, BlockKey};
use crate::common::{GuestAddr, HostAddr, JitResult};
use crate::dispatcher::GuestContext;
use crate::frontend::DecodedBlock;
use crate::ir::opcode::{ICmpCond, Opcode};
use crate::ir::{Instruction, ValueId};
use crate::stats::Stats;

fn producer_index(instrs: &[Instruction], id: ValueId) -> usize {
    instrs
        .iter()
        .position(|i| i.dest == Some(id))
        .expect("every operand has a producer earlier in the same block")
}

fn const_of(instrs: &[Instruction], id: ValueId) -> i64 {
    instrs[producer_index(instrs, id)]
        .imm
        .expect("Template::ConstMat's producer always carries its value in `imm`")
}

/// Assembled bytes plus the metadata a block needs once installed.
struct Assembled {
    code: Vec<u8>,
    fastmem_sites: Vec<FastmemSite>,
    relocations: Vec<Relocation>,
}

/// Emits `decoded`'s machine code and installs it into `cache` under `key`.
/// Returns the block's entry address.
///
/// # Errors
///
/// Returns [`crate::common::JitError::CodeCacheFull`] if the block still
/// does not fit after one cache reset.
pub fn emit(
    cache: &mut BlockCache,
    fastmem_base: HostAddr,
    thunks: &ThunkTable,
    key: BlockKey,
    decoded: DecodedBlock,
    stats: &mut Stats,
) -> JitResult<HostAddr> {
    let alloc = regalloc::allocate(&decoded.instructions);
    let asm = assemble(&decoded.instructions, &alloc, fastmem_base, thunks);
    let len = asm.code.len();

    let (buf, addr) = match cache.reserve_code(len) {
        Some(slot) => slot,
        None => {
            cache.reset(stats);
            cache.reserve_code(len).ok_or_else(|| BlockCache::full_error(len))?
        }
    };
    buf.copy_from_slice(&asm.code);

    Ok(cache.install(
        key,
        decoded.pc_lo,
        decoded.pc_hi,
        decoded.instructions,
        addr,
        len,
        asm.fastmem_sites,
        asm.relocations,
        stats,
    ))
}

/// After installing a new block at `new_entry` for `new_pc`, patches every
/// already-resident block's relocation that targets `new_pc` to jump
/// straight into it instead of falling back through the dispatcher.
pub fn chain_relocations(cache: &mut BlockCache, new_pc: GuestAddr, new_entry: HostAddr) {
    for (_key, code_ptr, code_offset) in cache.relocations_targeting(new_pc) {
        let next_instr_addr = HostAddr(code_ptr.val() + code_offset + 4);
        // SAFETY: `code_offset` was reserved by this same block's `emit`
        // call and is always the 4-byte `rel32` immediate of a `jmp`
        // already emitted there.
        unsafe {
            cache.patch(code_offset, 4, |buf| {
                X64Asm::patch_rel32(buf, 0, new_entry, next_instr_addr);
            });
        }
    }
}

fn assemble(
    instrs: &[Instruction],
    alloc: &regalloc::Allocation,
    fastmem_base: HostAddr,
    _thunks: &ThunkTable,
) -> Assembled {
    let mut asm = X64Asm::new();
    let mut fastmem_sites = Vec::new();
    let mut relocations = Vec::new();
    let mut pending_epilogue_jumps: Vec<usize> = Vec::new();

    emit_prologue(&mut asm);

    for (idx, instr) in instrs.iter().enumerate() {
        match select(instrs, idx) {
            Template::Nop | Template::Barrier => {}
            Template::ConstMat => emit_const(&mut asm, alloc, instr),
            Template::Move => emit_move(&mut asm, alloc, instr),
            Template::BinOpReg => emit_binop(&mut asm, alloc, instr),
            Template::ShiftImm => emit_shift_imm(&mut asm, alloc, instrs, instr),
            Template::ShiftReg => emit_shift_reg(&mut asm, alloc, instr),
            Template::Cmp(cond) => emit_cmp(&mut asm, alloc, instr, cond),
            Template::GuestRegLoad => emit_guest_reg_load(&mut asm, alloc, instr),
            Template::GuestRegStore => emit_guest_reg_store(&mut asm, alloc, instr),
            Template::MemLoad(width) => {
                emit_mem_load(&mut asm, alloc, fastmem_base, instr, width, &mut fastmem_sites);
            }
            Template::MemStore(width) => {
                emit_mem_store(&mut asm, alloc, fastmem_base, instr, width, &mut fastmem_sites);
            }
            Template::CallExternal => emit_call_external(&mut asm, alloc, instr),
            Template::Branch { direct } => emit_branch(
                &mut asm,
                alloc,
                instrs,
                instr,
                direct,
                &mut relocations,
                &mut pending_epilogue_jumps,
            ),
            Template::BranchCond => {
                emit_branch_cond(&mut asm, alloc, instr, &mut relocations, &mut pending_epilogue_jumps);
            }
            Template::Return => pending_epilogue_jumps.push(asm.jmp_rel32_placeholder()),
        }
    }

    let epilogue_offset = asm.len();
    for at in pending_epilogue_jumps {
        patch_local_rel32(&mut asm, at, epilogue_offset);
    }
    emit_epilogue(&mut asm);

    // Every fastmem site starts in its direct-load/store form; the thunk
    // table is only consulted later, by the fault handler, when a site
    // actually needs patching to its slowmem form.
    Assembled { code: asm.into_bytes(), fastmem_sites, relocations }
}

/// Patches a previously emitted `rel32` placeholder to a target within the
/// *same* buffer — address-independent, since both ends are local offsets.
fn patch_local_rel32(asm: &mut X64Asm, imm_offset: usize, target_offset: usize) {
    let rel = target_offset as i64 - (imm_offset as i64 + 4);
    let rel = i32::try_from(rel).expect("intra-block displacement always fits rel32");
    asm.patch_local(imm_offset, rel);
}

fn emit_prologue(asm: &mut X64Asm) {
    for r in [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, CONTEXT] {
        asm.push_reg(r);
    }
    asm.mov_rr(CONTEXT, ARG_REGS[0]);
}

fn emit_epilogue(asm: &mut X64Asm) {
    for r in [CONTEXT, Reg::R14, Reg::R13, Reg::R12, Reg::Rbx] {
        asm.pop_reg(r);
    }
    asm.ret();
}

fn load_to_reg(asm: &mut X64Asm, loc: Location, scratch: Reg) -> Reg {
    match loc {
        Location::Reg(r) => r,
        Location::Spill(s) => {
            asm.load_disp32(scratch, CONTEXT, GuestContext::spill_offset(s));
            scratch
        }
    }
}

fn store_from_reg(asm: &mut X64Asm, loc: Location, src: Reg) {
    if let Location::Spill(s) = loc {
        asm.store_disp32(CONTEXT, GuestContext::spill_offset(s), src);
    }
    // `Location::Reg(r)`: callers already arrange for the working register
    // to be `r` itself, so there is nothing left to store.
}

fn emit_store_pc_const(asm: &mut X64Asm, pc: u32) {
    asm.mov_imm64(TMP0, i64::from(pc));
    asm.store_disp32_w32(CONTEXT, GuestContext::pc_offset(), TMP0);
}

fn work_reg(alloc: &regalloc::Allocation, dest: ValueId, fallback: Reg) -> Reg {
    match alloc.location_of(dest) {
        Location::Reg(r) => r,
        Location::Spill(_) => fallback,
    }
}

fn emit_const(asm: &mut X64Asm, alloc: &regalloc::Allocation, instr: &Instruction) {
    let dest = instr.dest.unwrap();
    let dest_loc = alloc.location_of(dest);
    let work = work_reg(alloc, dest, TMP0);
    asm.mov_imm64(work, instr.imm.unwrap());
    store_from_reg(asm, dest_loc, work);
}

fn emit_move(asm: &mut X64Asm, alloc: &regalloc::Allocation, instr: &Instruction) {
    let dest = instr.dest.unwrap();
    let dest_loc = alloc.location_of(dest);
    let src_loc = alloc.location_of(instr.operand0().unwrap());
    let work = work_reg(alloc, dest, TMP0);
    let src = load_to_reg(asm, src_loc, work);
    asm.mov_rr(work, src);
    store_from_reg(asm, dest_loc, work);
}

fn emit_binop(asm: &mut X64Asm, alloc: &regalloc::Allocation, instr: &Instruction) {
    let dest = instr.dest.unwrap();
    let dest_loc = alloc.location_of(dest);
    let op0_loc = alloc.location_of(instr.operand0().unwrap());
    let op1_loc = alloc.location_of(instr.operand1().unwrap());
    let work = work_reg(alloc, dest, TMP0);

    let op0 = load_to_reg(asm, op0_loc, work);
    if op0 != work {
        asm.mov_rr(work, op0);
    }
    let op1 = load_to_reg(asm, op1_loc, TMP1);

    match instr.opcode {
        Opcode::Add => asm.add_rr(work, op1),
        Opcode::Sub => asm.sub_rr(work, op1),
        Opcode::And => asm.and_rr(work, op1),
        Opcode::Or => asm.or_rr(work, op1),
        Opcode::Xor => asm.xor_rr(work, op1),
        other => unreachable!("Template::BinOpReg selected for non-binop opcode {other:?}"),
    }
    store_from_reg(asm, dest_loc, work);
}

fn emit_shift_imm(asm: &mut X64Asm, alloc: &regalloc::Allocation, instrs: &[Instruction], instr: &Instruction) {
    let dest = instr.dest.unwrap();
    let dest_loc = alloc.location_of(dest);
    let op0_loc = alloc.location_of(instr.operand0().unwrap());
    let work = work_reg(alloc, dest, TMP0);

    let op0 = load_to_reg(asm, op0_loc, work);
    if op0 != work {
        asm.mov_rr(work, op0);
    }
    let amount = const_of(instrs, instr.operand1().unwrap()) as u8;

    match instr.opcode {
        Opcode::Shl => asm.shl_imm(work, amount),
        Opcode::Shr => asm.shr_imm(work, amount),
        Opcode::Sar => asm.sar_imm(work, amount),
        other => unreachable!("Template::ShiftImm selected for non-shift opcode {other:?}"),
    }
    store_from_reg(asm, dest_loc, work);
}

fn emit_shift_reg(asm: &mut X64Asm, alloc: &regalloc::Allocation, instr: &Instruction) {
    let dest = instr.dest.unwrap();
    let dest_loc = alloc.location_of(dest);
    let op0_loc = alloc.location_of(instr.operand0().unwrap());
    let op1_loc = alloc.location_of(instr.operand1().unwrap());
    let work = work_reg(alloc, dest, TMP0);

    // The count must land in `CL` (`TMP1`'s low byte) before `work` (which
    // may itself be `TMP0`) is loaded, so a spilled dividend can't clobber
    // it and vice versa.
    let count = load_to_reg(asm, op1_loc, TMP1);
    if count != TMP1 {
        asm.mov_rr(TMP1, count);
    }
    let op0 = load_to_reg(asm, op0_loc, work);
    if op0 != work {
        asm.mov_rr(work, op0);
    }

    match instr.opcode {
        Opcode::Shl => asm.shl_cl(work),
        Opcode::Shr => asm.shr_cl(work),
        Opcode::Sar => asm.sar_cl(work),
        other => unreachable!("Template::ShiftReg selected for non-shift opcode {other:?}"),
    }
    store_from_reg(asm, dest_loc, work);
}

fn emit_cmp(asm: &mut X64Asm, alloc: &regalloc::Allocation, instr: &Instruction, cond: ICmpCond) {
    let dest = instr.dest.unwrap();
    let dest_loc = alloc.location_of(dest);
    let op0_loc = alloc.location_of(instr.operand0().unwrap());
    let op1_loc = alloc.location_of(instr.operand1().unwrap());

    let a = load_to_reg(asm, op0_loc, TMP0);
    let b = load_to_reg(asm, op1_loc, TMP1);
    asm.cmp_rr(a, b);

    let work = work_reg(alloc, dest, TMP0);
    asm.setcc_zx(cond, work);
    store_from_reg(asm, dest_loc, work);
}

fn emit_guest_reg_load(asm: &mut X64Asm, alloc: &regalloc::Allocation, instr: &Instruction) {
    let dest = instr.dest.unwrap();
    let dest_loc = alloc.location_of(dest);
    let reg_id = instr.imm.unwrap() as u16;
    let work = work_reg(alloc, dest, TMP0);
    asm.load_disp32(work, CONTEXT, GuestContext::register_offset(reg_id));
    store_from_reg(asm, dest_loc, work);
}

fn emit_guest_reg_store(asm: &mut X64Asm, alloc: &regalloc::Allocation, instr: &Instruction) {
    let reg_id = instr.imm.unwrap() as u16;
    let src_loc = alloc.location_of(instr.operand0().unwrap());
    let src = load_to_reg(asm, src_loc, TMP0);
    asm.store_disp32(CONTEXT, GuestContext::register_offset(reg_id), src);
}

fn emit_mem_load(
    asm: &mut X64Asm,
    alloc: &regalloc::Allocation,
    fastmem_base: HostAddr,
    instr: &Instruction,
    width: crate::common::Width,
    sites: &mut Vec<FastmemSite>,
) {
    let dest = instr.dest.unwrap();
    let dest_loc = alloc.location_of(dest);
    let addr_loc = alloc.location_of(instr.operand0().unwrap());
    // `addr` is never `TMP0`/`TMP1` (the allocator never hands those out),
    // so resolving it before the base constant below can't lose it.
    let addr = load_to_reg(asm, addr_loc, TMP1);

    asm.mov_imm64(TMP0, fastmem_base.val() as i64);
    let work = work_reg(alloc, dest, TMP0);
    let before = asm.len();
    // `work` may alias `TMP0` (the base register); that's fine, the load
    // reads `[TMP0 + addr]` before it overwrites `TMP0` with the result.
    let offset = asm.load_mem(width, work, TMP0, addr, false);
    pad_fastmem_site(asm, before);
    sites.push(FastmemSite {
        code_offset: offset,
        reserved_len: FASTMEM_SITE_LEN,
        width,
        is_store: false,
        patched: false,
        addr_reg: addr,
        value_reg: None,
        dest_reg: Some(work),
    });

    store_from_reg(asm, dest_loc, work);
}

fn emit_mem_store(
    asm: &mut X64Asm,
    alloc: &regalloc::Allocation,
    fastmem_base: HostAddr,
    instr: &Instruction,
    width: crate::common::Width,
    sites: &mut Vec<FastmemSite>,
) {
    let addr_loc = alloc.location_of(instr.operand0().unwrap());
    let value_loc = alloc.location_of(instr.operand1().unwrap());

    let addr = load_to_reg(asm, addr_loc, TMP1);
    if addr != TMP1 {
        asm.mov_rr(TMP1, addr);
    }
    // A spilled value fills into `Rdx` rather than `TMP0`: `TMP0` is about
    // to be overwritten with the fastmem base, which would otherwise lose a
    // spilled value that happened to land there too.
    let value = load_to_reg(asm, value_loc, Reg::Rdx);

    asm.mov_imm64(TMP0, fastmem_base.val() as i64);

    let before = asm.len();
    let offset = asm.store_mem(width, TMP0, TMP1, value);
    pad_fastmem_site(asm, before);
    sites.push(FastmemSite {
        code_offset: offset,
        reserved_len: FASTMEM_SITE_LEN,
        width,
        is_store: true,
        patched: false,
        addr_reg: TMP1,
        value_reg: Some(value),
        dest_reg: None,
    });
}

/// Pads the fastmem instruction that started at `before` out to
/// [`FASTMEM_SITE_LEN`] with `nop`s, so the fault handler always has exactly
/// enough room to patch in a `mov_imm64 + call` thunk dispatch.
fn pad_fastmem_site(asm: &mut X64Asm, before: usize) {
    let emitted = asm.len() - before;
    assert!(emitted <= FASTMEM_SITE_LEN, "fastmem instruction {emitted} bytes exceeds the {FASTMEM_SITE_LEN}-byte reservation");
    for _ in emitted..FASTMEM_SITE_LEN {
        asm.nop();
    }
}

fn emit_call_external(asm: &mut X64Asm, alloc: &regalloc::Allocation, instr: &Instruction) {
    asm.mov_rr(ARG_REGS[0], CONTEXT);
    let args = [instr.operand0(), instr.operand1(), instr.operand2()];
    for (slot, operand) in args.into_iter().enumerate() {
        let Some(value) = operand else { continue };
        let loc = alloc.location_of(value);
        let reg = load_to_reg(asm, loc, TMP0);
        asm.mov_rr(ARG_REGS[slot + 1], reg);
    }
    let target = instr.imm.unwrap() as usize;
    asm.call_abs(HostAddr(target));

    if let Some(dest) = instr.dest {
        let dest_loc = alloc.location_of(dest);
        store_from_reg(asm, dest_loc, Reg::Rax);
    }
}

#[allow(clippy::too_many_arguments)]
fn emit_branch(
    asm: &mut X64Asm,
    alloc: &regalloc::Allocation,
    instrs: &[Instruction],
    instr: &Instruction,
    direct: bool,
    relocations: &mut Vec<Relocation>,
    pending_epilogue_jumps: &mut Vec<usize>,
) {
    if direct {
        let target_pc = const_of(instrs, instr.operand0().unwrap()) as u32;
        emit_store_pc_const(asm, target_pc);
        let at = asm.jmp_rel32_placeholder();
        relocations.push(Relocation { code_offset: at, target_pc: GuestAddr::new(target_pc) });
        pending_epilogue_jumps.push(at);
    } else {
        // Runtime target: store it into `ctx.pc` and fall back to the
        // dispatcher, which performs the cache lookup itself. Not
        // chainable — there is no single constant `target_pc` to record a
        // relocation against.
        let target_loc = alloc.location_of(instr.operand0().unwrap());
        let target = load_to_reg(asm, target_loc, TMP0);
        asm.store_disp32_w32(CONTEXT, GuestContext::pc_offset(), target);
        pending_epilogue_jumps.push(asm.jmp_rel32_placeholder());
    }
}

fn emit_branch_cond(
    asm: &mut X64Asm,
    alloc: &regalloc::Allocation,
    instr: &Instruction,
    relocations: &mut Vec<Relocation>,
    pending_epilogue_jumps: &mut Vec<usize>,
) {
    let (true_pc, false_pc) = crate::ir::builder::unpack_targets(instr.imm.unwrap());
    let cond_loc = alloc.location_of(instr.operand0().unwrap());
    let cond_reg = load_to_reg(asm, cond_loc, TMP0);
    asm.test_rr(cond_reg, cond_reg);
    let jcc_at = asm.jcc_rel32_placeholder(ICmpCond::Ne);

    // False path: falls straight through from the `jcc` above.
    emit_store_pc_const(asm, false_pc);
    let false_jmp = asm.jmp_rel32_placeholder();
    relocations.push(Relocation { code_offset: false_jmp, target_pc: GuestAddr::new(false_pc) });
    pending_epilogue_jumps.push(false_jmp);

    // True path: the `jcc` above lands here.
    let true_path_offset = asm.len();
    patch_local_rel32(asm, jcc_at, true_path_offset);
    emit_store_pc_const(asm, true_pc);
    let true_jmp = asm.jmp_rel32_placeholder();
    relocations.push(Relocation { code_offset: true_jmp, target_pc: GuestAddr::new(true_pc) });
    pending_epilogue_jumps.push(true_jmp);
}
