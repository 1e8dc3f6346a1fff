//! Process-wide host memory-access fault handler (design §4.6).
//!
//! Fastmem loads/stores hit the raw host arena with no bounds check; an
//! access that lands outside every mapped region's identity-offset window
//! raises `SIGSEGV`. This module installs a `sigaction` handler that turns
//! that first fault into a one-time code patch: the faulting fastmem site
//! is rewritten, in place, into a call to the matching slowmem thunk, and
//! execution resumes at the (now patched) instruction. Every fastmem access
//! through that site from then on runs the slowmem thunk's own
//! bounds-checked `AddressSpace` read/write instead of faulting again.
//!
//! A POSIX signal handler is a bare `extern "C" fn` — it cannot borrow Rust
//! state through the call stack that triggered it. The block cache and
//! thunk table it needs are reached instead through a process-wide static,
//! populated once by [`FaultHandler::install`]. This is sound under the
//! single-CPU-thread ownership model (design §5): the handler only ever
//! runs synchronously on the thread that was executing JIT code when the
//! fault landed, reentering the very `BlockCache`/`ThunkTable` that thread
//! already owns exclusively. It is not sound to install more than one
//! `FaultHandler` for overlapping `BlockCache`s in the same process.
//!
//! `cfg(target_arch = "x86_64")`-gated along with the rest of the backend
//! (design §4.4.1): the fastmem site layout this patches is specific to the
//! x64 encoder.

#![cfg(target_arch = "x86_64")]

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::backend::registers::{Reg, ARG_REGS, CONTEXT};
use crate::backend::thunks::ThunkTable;
use crate::backend::x64::X64Asm;
use crate::block::FastmemSite;
use crate::cache::BlockCache;
use crate::common::{HostAddr, JitError, JitResult};
use crate::stats::Stats;

/// The live state a fault needs, reached through [`FAULT_STATE`].
///
/// Every pointer here is borrowed from the `Dispatcher` that calls
/// [`FaultHandler::install`]; none of them are owned by this module.
struct FaultState {
    cache: *mut BlockCache,
    thunks: *const ThunkTable,
    stats: *mut Stats,
}

// SAFETY: touched only by `handle_segv`, which by the module-level argument
// above runs exclusively on the single thread that already has exclusive
// access to the pointees.
unsafe impl Send for FaultState {}
unsafe impl Sync for FaultState {}

static FAULT_STATE: AtomicPtr<FaultState> = AtomicPtr::new(std::ptr::null_mut());
static PREV_ACTION: AtomicPtr<libc::sigaction> = AtomicPtr::new(std::ptr::null_mut());

/// Installs (and, on drop, uninstalls) the process-wide `SIGSEGV` handler
/// for fastmem faults.
///
/// Only one instance should be live at a time; installing a second while
/// the first is still live replaces the handler both share, and whichever
/// is dropped first restores the *original* prior handler out from under
/// the other. `Dispatcher::new` installs exactly one per process.
#[derive(Debug)]
pub struct FaultHandler {
    _private: (),
}

impl FaultHandler {
    /// Registers `handle_segv` as the process's `SIGSEGV` handler, pointing
    /// it at `cache`/`thunks`/`stats` via [`FAULT_STATE`].
    ///
    /// # Safety
    ///
    /// `cache`, `thunks`, and `stats` must remain valid and exclusively
    /// owned by the calling thread for as long as the returned
    /// `FaultHandler` (or any earlier one still installed) is live — in
    /// practice, the lifetime of the `Dispatcher` that owns them.
    ///
    /// # Errors
    ///
    /// Returns [`JitError::FaultHandlerInstallFailed`] if the kernel
    /// rejects the `sigaction` call.
    pub unsafe fn install(cache: &mut BlockCache, thunks: &ThunkTable, stats: &mut Stats) -> JitResult<Self> {
        let state = Box::new(FaultState {
            cache: std::ptr::from_mut(cache),
            thunks: std::ptr::from_ref(thunks),
            stats: std::ptr::from_mut(stats),
        });
        let old_state = FAULT_STATE.swap(Box::into_raw(state), Ordering::AcqRel);
        if !old_state.is_null() {
            // SAFETY: `old_state` was created by a prior `Box::into_raw` in
            // this same function and has not been freed since.
            drop(unsafe { Box::from_raw(old_state) });
        }

        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handle_segv as usize;
        action.sa_flags = libc::SA_SIGINFO;
        // SAFETY: `action.sa_mask` is a valid, stack-local `sigset_t`.
        unsafe { libc::sigemptyset(&mut action.sa_mask) };

        let mut prev: libc::sigaction = unsafe { std::mem::zeroed() };
        // SAFETY: `action` is a fully initialized `SA_SIGINFO` sigaction and
        // `prev` is a valid out-pointer the kernel fills on success.
        let rc = unsafe { libc::sigaction(libc::SIGSEGV, &action, &mut prev) };
        if rc != 0 {
            // SAFETY: called immediately after the failing libc call, before
            // any other libc call on this thread could clobber it.
            let errno = unsafe { *libc::__errno_location() };
            return Err(JitError::FaultHandlerInstallFailed { errno });
        }

        let old_prev = PREV_ACTION.swap(Box::into_raw(Box::new(prev)), Ordering::AcqRel);
        if !old_prev.is_null() {
            // SAFETY: same reasoning as the `old_state` drop above.
            drop(unsafe { Box::from_raw(old_prev) });
        }

        tracing::debug!("installed fastmem SIGSEGV handler");
        Ok(Self { _private: () })
    }
}

impl Drop for FaultHandler {
    fn drop(&mut self) {
        let prev = PREV_ACTION.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !prev.is_null() {
            // SAFETY: `prev` was filled in by a real `sigaction` call in
            // `install` and has not been mutated since.
            let prev = unsafe { Box::from_raw(prev) };
            // SAFETY: restores whatever handler preceded this one; `*prev`
            // is the exact `sigaction` struct the kernel itself populated.
            unsafe {
                let _ = libc::sigaction(libc::SIGSEGV, &*prev, std::ptr::null_mut());
            }
        }
        let state = FAULT_STATE.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !state.is_null() {
            // SAFETY: `state` was allocated by `Box::into_raw` in `install`.
            drop(unsafe { Box::from_raw(state) });
        }
    }
}

/// The `SIGSEGV` handler. Looks the faulting instruction address up in the
/// resident fastmem site table; patches and resumes on a hit, forwards to
/// whatever handler preceded this one (or re-raises with the default
/// disposition) on a miss.
extern "C" fn handle_segv(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let state_ptr = FAULT_STATE.load(Ordering::Acquire);
    if state_ptr.is_null() {
        forward_or_abort(sig, info, ctx);
        return;
    }
    // SAFETY: non-null only while a `FaultHandler` is installed, per the
    // module-level single-CPU-thread argument; the pointee outlives every
    // fault that can reach this handler while that holds.
    let state = unsafe { &*state_ptr };

    let Some(fault_pc) = faulting_instruction_addr(ctx) else {
        forward_or_abort(sig, info, ctx);
        return;
    };

    // SAFETY: `state.cache` is valid per the contract above.
    let cache = unsafe { &mut *state.cache };
    let Some((key, site_idx)) = cache.find_fastmem_site(fault_pc) else {
        forward_or_abort(sig, info, ctx);
        return;
    };

    // SAFETY: `state.thunks` is valid per the contract above.
    let thunks = unsafe { &*state.thunks };
    let Some(block) = cache.block_mut(key) else {
        forward_or_abort(sig, info, ctx);
        return;
    };
    let site = block.fastmem_sites[site_idx];
    let target = if site.is_store {
        thunks.store_thunk(site.width)
    } else {
        // Fastmem loads always zero-extend (design §4.2): sign extension,
        // when the guest instruction needs it, is a separate `SignExtend`
        // IR op the emitter lowers after this one, so the replacement
        // thunk must match with `signed = false` too.
        thunks.load_thunk(site.width, false)
    };

    // SAFETY: `patch` is given exactly `site.reserved_len` bytes starting at
    // `site.code_offset`, which the emitter reserved for precisely this
    // `mov_imm64 + call` replacement (`crate::block::FASTMEM_SITE_LEN`).
    unsafe {
        cache.patch(site.code_offset, site.reserved_len, |buf| {
            patch_site(buf, target, &site);
        });
    }
    if let Some(block) = cache.block_mut(key) {
        block.fastmem_sites[site_idx].patched = true;
    }

    // SAFETY: `state.stats` is valid per the contract above.
    let stats = unsafe { &mut *state.stats };
    stats.fastmem_faults_patched += 1;
    tracing::debug!(pc = fault_pc.val(), width = ?site.width, is_store = site.is_store, "patched fastmem site to slowmem");

    // No adjustment to the saved instruction pointer: we patched the very
    // instruction it already points at, so returning from the handler
    // re-executes it as the new `mov_imm64 + call` sequence.
}

/// Overwrites `buf` (exactly [`crate::block::FASTMEM_SITE_LEN`] bytes) with
/// the slowmem dispatch: marshal `CONTEXT`, the site's address register,
/// and (for a store) its value register into the SysV argument registers
/// `SlowmemThunk` reads (`rdi`/`rsi`/`rdx`), call `thunk`, and — for a load —
/// move the thunk's `rax` return into the site's destination register,
/// since the direct-form load this replaces no longer runs.
fn patch_site(buf: &mut [u8], thunk: HostAddr, site: &FastmemSite) {
    let mut asm = X64Asm::new();
    asm.mov_rr(ARG_REGS[0], CONTEXT);
    asm.mov_rr(ARG_REGS[1], site.addr_reg);
    if let Some(value_reg) = site.value_reg {
        asm.mov_rr(ARG_REGS[2], value_reg);
    }
    asm.call_abs(thunk);
    if let Some(dest_reg) = site.dest_reg {
        asm.mov_rr(dest_reg, Reg::Rax);
    }
    let bytes = asm.into_bytes();
    debug_assert!(bytes.len() <= buf.len(), "thunk call sequence must fit the reserved fastmem site");
    buf[..bytes.len()].copy_from_slice(&bytes);
    for b in &mut buf[bytes.len()..] {
        *b = 0x90; // nop
    }
}

/// Extracts the faulting instruction's host address from the `ucontext_t`
/// the kernel hands the handler, on the platforms `libc` exposes `RIP`
/// register access for.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn faulting_instruction_addr(ctx: *mut libc::c_void) -> Option<HostAddr> {
    if ctx.is_null() {
        return None;
    }
    // SAFETY: the kernel passes a valid `ucontext_t*` as the third signal
    // handler argument when `SA_SIGINFO` is set, which is the case for the
    // only handler this module installs.
    let ucontext = unsafe { &*ctx.cast::<libc::ucontext_t>() };
    let rip = ucontext.uc_mcontext.gregs[libc::REG_RIP as usize];
    Some(HostAddr(rip as usize))
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn faulting_instruction_addr(_ctx: *mut libc::c_void) -> Option<HostAddr> {
    None
}

/// A fault this handler doesn't own: chain to whatever handler preceded it,
/// or fall back to the default disposition (terminate) if there was none.
fn forward_or_abort(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let prev_ptr = PREV_ACTION.load(Ordering::Acquire);
    if !prev_ptr.is_null() {
        // SAFETY: `prev_ptr` was filled in by a real `sigaction` call and
        // is only ever read, never mutated, outside `install`/`drop`.
        let prev = unsafe { &*prev_ptr };
        if prev.sa_sigaction != libc::SIG_DFL && prev.sa_sigaction != libc::SIG_IGN {
            if prev.sa_flags & libc::SA_SIGINFO != 0 {
                // SAFETY: `prev.sa_sigaction` was installed with
                // `SA_SIGINFO` by whatever owned `SIGSEGV` before us, so it
                // expects the three-argument form.
                let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    unsafe { std::mem::transmute(prev.sa_sigaction) };
                handler(sig, info, ctx);
                return;
            }
            // SAFETY: same as above, but for the plain one-argument form.
            let handler: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(prev.sa_sigaction) };
            handler(sig);
            return;
        }
    }
    // SAFETY: restores the default disposition and re-raises so the process
    // terminates the way an unhandled `SIGSEGV` normally would.
    unsafe {
        let mut dfl: libc::sigaction = std::mem::zeroed();
        dfl.sa_sigaction = libc::SIG_DFL;
        let _ = libc::sigaction(libc::SIGSEGV, &dfl, std::ptr::null_mut());
        let _ = libc::raise(libc::SIGSEGV);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_site() -> FastmemSite {
        FastmemSite {
            code_offset: 0,
            reserved_len: crate::block::FASTMEM_SITE_LEN,
            width: crate::common::Width::W32,
            is_store: true,
            patched: false,
            addr_reg: Reg::Rcx,
            value_reg: Some(Reg::Rdx),
            dest_reg: None,
        }
    }

    fn load_site() -> FastmemSite {
        FastmemSite {
            code_offset: 0,
            reserved_len: crate::block::FASTMEM_SITE_LEN,
            width: crate::common::Width::W32,
            is_store: false,
            patched: false,
            addr_reg: Reg::Rbx,
            value_reg: None,
            dest_reg: Some(Reg::R12),
        }
    }

    #[test]
    fn patch_site_marshals_store_args_and_fills_the_reserved_length() {
        let mut buf = [0u8; crate::block::FASTMEM_SITE_LEN];
        let site = store_site();
        patch_site(&mut buf, HostAddr(0xdead_beef_0000), &site);

        let mut expected = X64Asm::new();
        expected.mov_rr(ARG_REGS[0], CONTEXT);
        expected.mov_rr(ARG_REGS[1], site.addr_reg);
        expected.mov_rr(ARG_REGS[2], site.value_reg.unwrap());
        expected.call_abs(HostAddr(0xdead_beef_0000));
        let mut expected_bytes = expected.into_bytes();
        expected_bytes.resize(crate::block::FASTMEM_SITE_LEN, 0x90);
        assert_eq!(&buf[..], &expected_bytes[..]);
    }

    #[test]
    fn patch_site_marshals_load_args_and_recovers_the_return_value() {
        let mut buf = [0u8; crate::block::FASTMEM_SITE_LEN];
        let site = load_site();
        patch_site(&mut buf, HostAddr(0xdead_beef_0000), &site);

        let mut expected = X64Asm::new();
        expected.mov_rr(ARG_REGS[0], CONTEXT);
        expected.mov_rr(ARG_REGS[1], site.addr_reg);
        expected.call_abs(HostAddr(0xdead_beef_0000));
        expected.mov_rr(site.dest_reg.unwrap(), Reg::Rax);
        let mut expected_bytes = expected.into_bytes();
        expected_bytes.resize(crate::block::FASTMEM_SITE_LEN, 0x90);
        assert_eq!(&buf[..], &expected_bytes[..]);
    }

    #[test]
    fn patch_site_pads_a_larger_reservation_with_nops() {
        let mut buf = [0u8; crate::block::FASTMEM_SITE_LEN + 4];
        patch_site(&mut buf, HostAddr(0x1234), &store_site());
        assert!(buf[crate::block::FASTMEM_SITE_LEN..].iter().all(|&b| b == 0x90));
    }
}
