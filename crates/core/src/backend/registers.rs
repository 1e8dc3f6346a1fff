//! Host register conventions, fixed at backend construction.
//!
//! Grounded on the original `x64_backend.h`'s register table (`x64_registers`,
//! `x64_arg0_idx`/`x64_tmp0_idx`, etc.) but expressed as a Rust enum with
//! named constants rather than a parallel `extern const` array and index
//! constants.

/// A general-purpose x86_64 register, by its 4-bit encoding (REX.B/X/R
/// extends it to 5 bits where needed; callers add the REX prefix).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)] // the docs are the register names themselves
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    /// The register's 4-bit encoding (low 3 bits go in the ModRM/SIB byte;
    /// the 4th bit is REX.B/X/R).
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Rax => 0,
            Self::Rcx => 1,
            Self::Rdx => 2,
            Self::Rbx => 3,
            Self::Rsp => 4,
            Self::Rbp => 5,
            Self::Rsi => 6,
            Self::Rdi => 7,
            Self::R8 => 8,
            Self::R9 => 9,
            Self::R10 => 10,
            Self::R11 => 11,
            Self::R12 => 12,
            Self::R13 => 13,
            Self::R14 => 14,
            Self::R15 => 15,
        }
    }

    /// The low 3 bits of [`Self::code`], for the ModRM/SIB reg/rm field.
    #[must_use]
    pub const fn low3(self) -> u8 {
        self.code() & 0b111
    }

    /// Whether encoding this register requires a REX prefix bit set (`R8`
    /// through `R15`).
    #[must_use]
    pub const fn needs_rex_bit(self) -> bool {
        self.code() >= 8
    }
}

/// Host register pinned to the guest-context pointer for a block's entire
/// execution. Never allocated to an IR value.
pub const CONTEXT: Reg = Reg::R15;

/// Scratch temporary reserved for spill fill/spill and address computation.
/// Never allocated to an IR value.
pub const TMP0: Reg = Reg::Rax;

/// Second scratch temporary; also the only register that can feed a
/// variable shift count (`shl r/m64, cl`), since x86_64 hardwires that to
/// `RCX`.
pub const TMP1: Reg = Reg::Rcx;

/// Argument registers used when emitting calls into slowmem thunks and MMIO
/// callbacks (System V AMD64 integer argument order, first three).
pub const ARG_REGS: [Reg; 3] = [Reg::Rdi, Reg::Rsi, Reg::Rdx];

/// Registers the allocator may hand out to IR values: exactly the
/// callee-saved GPRs the block prologue/epilogue already push and pop
/// (`emitter::emit_prologue`/`emit_epilogue`), minus `CONTEXT`. A value the
/// allocator gives out here is guaranteed to survive any `call` emitted
/// inside the block — a slowmem thunk, an MMIO callback, or
/// `Template::CallExternal` — without needing caller-saved spill/reload
/// bookkeeping around every call site. `R8`-`R11` are deliberately excluded:
/// they're caller-saved under SysV and a `call` is free to clobber them.
pub const ALLOCATABLE: [Reg; 4] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14];
