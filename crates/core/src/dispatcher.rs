//! The dispatcher: owns the guest context, address space, and block cache,
//! and drives the compile-or-execute run loop (design §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::emitter;
use crate::backend::thunks::ThunkTable;
use crate::block::ContextFlags;
use crate::cache::{BlockCache, BlockKey};
use crate::common::{GuestAddr, JitResult};
use crate::config::Config;
#[cfg(target_arch = "x86_64")]
use crate::fault::FaultHandler;
use crate::frontend;
use crate::isa::decode::{self, Op};
use crate::isa::NUM_GP_REGS;
use crate::memory::AddressSpace;
use crate::stats::Stats;

/// Number of 8-byte spill slots every compiled block may draw from. Sized
/// comfortably above anything the allocator's own tests have needed; a
/// block that exhausts this is a backend bug, not a guest-program condition.
pub const SPILL_SLOTS: usize = 64;

/// The register file and fixed-offset scratch area every compiled block
/// addresses through [`crate::backend::registers::CONTEXT`] (`R15`).
///
/// `#[repr(C)]` so the field offsets the emitter bakes into `[R15 + disp32]`
/// operands are stable and computable with `core::mem::offset_of!`.
#[repr(C)]
pub struct GuestContext {
    /// The 16 general guest registers.
    pub registers: [u64; NUM_GP_REGS],
    /// Current guest program counter.
    pub pc: u32,
    /// Context-flag bits (FPU mode, privilege level); read by the frontend
    /// when forming a block's `BlockKey`.
    pub flags: ContextFlags,
    /// Spill slots the register allocator assigns when it runs out of host
    /// registers.
    pub spill: [u64; SPILL_SLOTS],
    /// Raw pointer back to the owning `AddressSpace`, for slowmem thunks to
    /// call into. Set once in [`Dispatcher::new`] and never null afterward.
    pub address_space: *mut AddressSpace,
}

// SAFETY: `address_space` points at a `Box<AddressSpace>` owned by the same
// `Dispatcher`; `GuestContext` is only ever touched from the single CPU
// thread that owns the `Dispatcher` (design §5), mirroring the `AddressSpace`
// `Send` marker this struct embeds a pointer to.
unsafe impl Send for GuestContext {}

impl GuestContext {
    fn new(address_space: *mut AddressSpace) -> Self {
        Self {
            registers: [0; NUM_GP_REGS],
            pc: 0,
            flags: ContextFlags::default(),
            spill: [0; SPILL_SLOTS],
            address_space,
        }
    }

    /// Byte offset of guest register `reg_id` within the context struct.
    #[must_use]
    pub fn register_offset(reg_id: u16) -> i32 {
        let base = std::mem::offset_of!(GuestContext, registers);
        (base + reg_id as usize * 8) as i32
    }

    /// Byte offset of the `pc` field.
    #[must_use]
    pub fn pc_offset() -> i32 {
        std::mem::offset_of!(GuestContext, pc) as i32
    }

    /// Byte offset of spill slot `slot`.
    #[must_use]
    pub fn spill_offset(slot: usize) -> i32 {
        let base = std::mem::offset_of!(GuestContext, spill);
        (base + slot * 8) as i32
    }
}

/// Owns every piece of emulator state and runs the compile-or-execute loop:
/// look up the current `(pc, flags)` in the block cache, compile on a miss,
/// then call into the resident machine code.
pub struct Dispatcher {
    context: Box<GuestContext>,
    address_space: Box<AddressSpace>,
    cache: BlockCache,
    thunks: ThunkTable,
    stats: Stats,
    config: Config,
    /// Checked once per block; sibling threads (e.g. a future `Ctrl-C`
    /// handler) can request a clean stop without unsafely reaching into the
    /// dispatcher itself.
    stop: Arc<AtomicBool>,
    /// Owns the process-wide fastmem `SIGSEGV` handler for this
    /// dispatcher's `cache`/`thunks`/`stats`; uninstalled on drop. Absent on
    /// non-x86_64 hosts, where there is no fastmem arena to fault on.
    #[cfg(target_arch = "x86_64")]
    fault_handler: FaultHandler,
}

impl Dispatcher {
    /// Builds a dispatcher with a freshly reserved address space and an
    /// empty block cache, per `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let mut address_space = Box::new(AddressSpace::new(&config.address_space));
        let context = Box::new(GuestContext::new(std::ptr::addr_of_mut!(*address_space)));
        #[allow(unused_mut)] // only mutated to install the fault handler below, on x86_64
        let mut cache = BlockCache::new(config.code_cache.arena_size);
        let thunks = ThunkTable::new();
        #[allow(unused_mut)]
        let mut stats = Stats::new();

        #[cfg(target_arch = "x86_64")]
        // SAFETY: `cache`/`thunks`/`stats` are moved into the `Dispatcher`
        // this handler's lifetime is tied to below, and — per design §5 —
        // are only ever touched from the single CPU thread that owns this
        // `Dispatcher`, the same thread any fault this handler services
        // will have been running on.
        let fault_handler =
            unsafe { FaultHandler::install(&mut cache, &thunks, &mut stats) }.expect("failed to install the fastmem fault handler");

        Self {
            context,
            address_space,
            cache,
            thunks,
            stats,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            #[cfg(target_arch = "x86_64")]
            fault_handler,
        }
    }

    /// Mutable access to the guest address space, for the embedder to map
    /// RAM/ROM/MMIO before the first `run` call.
    pub fn address_space_mut(&mut self) -> &mut AddressSpace {
        &mut self.address_space
    }

    /// A clone of the stop flag; setting it from another thread causes
    /// [`Self::run`] to return after the in-flight block completes.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Current statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Sets the guest program counter execution resumes from.
    pub fn set_pc(&mut self, pc: GuestAddr) {
        self.context.pc = pc.val();
    }

    /// Current guest program counter.
    #[must_use]
    pub fn pc(&self) -> GuestAddr {
        GuestAddr::new(self.context.pc)
    }

    /// The 16 general guest registers, for embedders and tests inspecting
    /// state after a run (mirrors `rvsim`'s `Cpu::dump_state`).
    #[must_use]
    pub fn guest_registers(&self) -> &[u64; crate::isa::NUM_GP_REGS] {
        &self.context.registers
    }

    /// Sets guest register `reg_id` directly, for seeding state before a run.
    pub fn set_guest_register(&mut self, reg_id: usize, value: u64) {
        self.context.registers[reg_id] = value;
    }

    /// Drops every cached block whose guest range intersects
    /// `[guest_lo, guest_hi)`. The embedder calls this after writing guest
    /// code from outside JIT-compiled execution — a loader patch, a DMA
    /// transfer, a debugger poke — so a later `run` recompiles instead of
    /// executing stale code (design §4.3, self-modifying code).
    pub fn invalidate_range(&mut self, guest_lo: GuestAddr, guest_hi: GuestAddr) {
        self.cache.invalidate_range(guest_lo, guest_hi, &mut self.stats);
    }

    /// Runs until `max_steps` blocks have executed, the stop flag is set, or
    /// compilation hits an unrecoverable error.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::common::JitError::CodeCacheFull`] if a block
    /// still does not fit after the cache has been reset once, and
    /// [`crate::common::JitError::IrTypeError`] for a frontend/builder bug.
    pub fn run(&mut self, max_steps: u64) -> JitResult<()> {
        for _ in 0..max_steps {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> JitResult<()> {
        let pc = GuestAddr::new(self.context.pc);
        let key = BlockKey::new(pc, self.context.flags);

        let code_ptr = match self.cache.lookup(key, &mut self.stats) {
            Some(ptr) => ptr,
            None => self.compile_block(key)?,
        };

        // SAFETY: `code_ptr` is either a freshly installed block's entry
        // point or one returned by a prior `lookup`, both of which point at
        // executable, position-independent code emitted by `emitter::emit`
        // with the `extern "C" fn(*mut GuestContext)` calling convention.
        let entry: extern "C" fn(*mut GuestContext) = unsafe { std::mem::transmute(code_ptr.val()) };
        entry(self.context.as_mut());
        Ok(())
    }

    fn compile_block(&mut self, key: BlockKey) -> JitResult<crate::common::HostAddr> {
        let decoded = frontend::decode_block(
            &mut self.address_space,
            key.pc,
            self.config.code_cache.max_block_len,
            &mut self.stats,
        )?;

        let fastmem_base = self.address_space.fastmem_base();
        let entry = emitter::emit(&mut self.cache, fastmem_base, &self.thunks, key, decoded, &mut self.stats)?;
        emitter::chain_relocations(&mut self.cache, key.pc, entry);
        Ok(entry)
    }
}

/// The interpreter-fallback entry point: executes exactly one guest
/// instruction against `ctx` directly, without going through the JIT, then
/// advances `ctx.pc`. Reached whenever a compiled block hits a `Trap` or an
/// opcode the frontend has no IR lowering for (design §4.5, §7
/// `UnsupportedOpcode`).
pub extern "C" fn interpreter_fallback(ctx: *mut GuestContext, pc: u64, raw: u64) {
    // SAFETY: called only from JIT-emitted code with the context pointer it
    // was entered with, and `pc`/`raw` are compile-time constants the
    // frontend captured from the instruction it could not lower.
    let ctx = unsafe { &mut *ctx };
    let pc = GuestAddr::new(pc as u32);
    let decoded = decode::decode(raw as u16);
    interpret_one(ctx, pc, &decoded);
}

fn interpret_one(ctx: &mut GuestContext, pc: GuestAddr, decoded: &decode::Decoded) {
    // SAFETY: `ctx.address_space` was set in `Dispatcher::new` to a pointer
    // the dispatcher keeps alive for the context's entire lifetime.
    let mem = unsafe { &mut *ctx.address_space };
    let reg = |ctx: &GuestContext, r: usize| ctx.registers[r];

    let mut next_pc = pc.wrapping_add(crate::isa::INSTR_LEN);
    match decoded.op {
        Op::Add => ctx.registers[decoded.rd] = reg(ctx, decoded.rs1).wrapping_add(reg(ctx, decoded.rs2)),
        Op::Sub => ctx.registers[decoded.rd] = reg(ctx, decoded.rs1).wrapping_sub(reg(ctx, decoded.rs2)),
        Op::And => ctx.registers[decoded.rd] = reg(ctx, decoded.rs1) & reg(ctx, decoded.rs2),
        Op::Or => ctx.registers[decoded.rd] = reg(ctx, decoded.rs1) | reg(ctx, decoded.rs2),
        Op::Xor => ctx.registers[decoded.rd] = reg(ctx, decoded.rs1) ^ reg(ctx, decoded.rs2),
        Op::Slt => {
            ctx.registers[decoded.rd] = u64::from((reg(ctx, decoded.rs1) as i64) < (reg(ctx, decoded.rs2) as i64));
        }
        Op::Sltu => {
            ctx.registers[decoded.rd] = u64::from(reg(ctx, decoded.rs1) < reg(ctx, decoded.rs2));
        }
        Op::Addi => {
            ctx.registers[decoded.rd] = reg(ctx, decoded.rs1).wrapping_add(decoded.imm as i64 as u64);
        }
        Op::Shli => ctx.registers[decoded.rd] = reg(ctx, decoded.rs1) << (decoded.imm & 0x3f),
        Op::Shri => ctx.registers[decoded.rd] = reg(ctx, decoded.rs1) >> (decoded.imm & 0x3f),
        Op::Load32 => {
            let addr = GuestAddr::new(reg(ctx, decoded.rs1) as u32);
            ctx.registers[decoded.rd] = u64::from(mem.read32(addr));
        }
        Op::Store32 => {
            let addr = GuestAddr::new(reg(ctx, decoded.rs1) as u32);
            mem.write32(addr, reg(ctx, decoded.rs2) as u32);
        }
        Op::Beq => {
            if reg(ctx, decoded.rs1) == reg(ctx, decoded.rs2) {
                next_pc = next_pc.wrapping_add((decoded.imm * 2) as u32);
            }
        }
        Op::Bra => next_pc = next_pc.wrapping_add((decoded.imm * 2) as u32),
        Op::Trap | Op::Unsupported => {}
    }
    ctx.pc = next_pc.val();
}
