//! The guest instruction set architecture.
//!
//! This crate does not target the Dreamcast's real SH-4 core. It implements
//! an invented, compact fixed-width ISA in the spirit of the SH-4's
//! encoding style (the fit this core's frontend was designed around): every
//! instruction is a 16-bit halfword, decomposed into a 4-bit major opcode
//! and up to three 4-bit operand fields. This keeps the decode table small
//! while still exercising every part of the frontend/IR/backend pipeline —
//! register-register ALU ops, register-immediate ALU ops, typed loads and
//! stores, conditional and unconditional branches, and a software trap that
//! forces the interpreter-fallback path.
//!
//! # Register file
//!
//! 16 general-purpose registers, `r0`..`r15`, each holding a 64-bit value.
//! None is hardwired to zero; all are freely readable and writable.

/// Instruction bit-field extraction and the `decode` entry point.
pub mod decode;

pub use decode::{decode, Decoded, Op};

/// Number of general-purpose guest registers.
pub const NUM_GP_REGS: usize = 16;

/// Width in bytes of one guest instruction (this ISA is fixed-width).
pub const INSTR_LEN: u32 = 2;
