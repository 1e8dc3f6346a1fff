//! The crate's unified error type.
//!
//! This module defines the error handling used throughout the JIT core. It
//! mirrors the shape of a real `rvsim`-style trap enum (one variant per
//! distinguishable failure, each carrying the diagnostic payload a caller
//! needs) but expressed as a `thiserror` error rather than a bare `Display`
//! impl, since every variant here is a genuine `Result`-propagated error
//! rather than a guest-visible trap value.

use crate::common::addr::GuestAddr;

/// Errors raised by the address space, IR builder, block cache, and backend.
///
/// See design §7 for the propagation policy: `OverlapError` is a caller bug
/// and propagates to the embedder; `UnmappedAccess` is logged and handled
/// internally (a slow read returns a sentinel, a slow write is discarded);
/// `IRTypeError` and a second `CodeCacheFull` are fatal internal-invariant
/// violations; `UnsupportedOpcode` triggers an interpreter-fallback call
/// rather than aborting the block.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    /// A `map_ram`/`map_rom`/`map_mmio` call's range intersects an existing
    /// region. Caller bug — propagate to the embedder.
    #[error("guest range {lo:#010x}..{hi:#010x} overlaps an existing region")]
    OverlapError {
        /// Inclusive lower bound of the rejected range.
        lo: u32,
        /// Exclusive upper bound of the rejected range.
        hi: u32,
    },

    /// A read or write touched a guest address with no registered region.
    ///
    /// Never fatal: slow reads return a sentinel value (0) and slow writes
    /// are discarded; the JIT patches the originating fastmem site to
    /// slowmem and continues.
    #[error("unmapped guest access at {0:#010x}")]
    UnmappedAccess(GuestAddr),

    /// The frontend or IR builder produced an instruction whose operand
    /// types are incompatible with its opcode. This is a frontend/compiler
    /// bug, not a guest-level condition, and is fatal with a diagnostic dump.
    #[error("IR type error in opcode {opcode}: {detail}")]
    IrTypeError {
        /// Name of the offending opcode.
        opcode: &'static str,
        /// Human-readable description of the mismatch.
        detail: String,
    },

    /// The executable-code arena could not fit a newly assembled block even
    /// after a `BlockCache::reset`. A single reset-and-retry is attempted
    /// automatically (§4.4); this variant is the second, fatal failure.
    #[error("code cache arena exhausted after reset (block needs {needed} bytes)")]
    CodeCacheFull {
        /// Bytes the block that triggered the failure required.
        needed: usize,
    },

    /// The frontend decoded a guest opcode it has no IR lowering for.
    ///
    /// Not fatal: the frontend emits a call to the interpreter fallback for
    /// the single instruction and terminates the block there.
    #[error("unsupported guest opcode {0:#06x} at {1:#010x}")]
    UnsupportedOpcode(u16, GuestAddr),

    /// `sigaction` rejected installing the fastmem SIGSEGV handler. Fatal:
    /// without it a genuine fastmem miss would crash the process instead of
    /// patching to slowmem.
    #[error("failed to install the fastmem fault handler (errno {errno})")]
    FaultHandlerInstallFailed {
        /// `errno` captured immediately after the failing `sigaction` call.
        errno: i32,
    },
}

/// Convenience alias for results that fail with [`JitError`].
pub type JitResult<T> = Result<T, JitError>;
