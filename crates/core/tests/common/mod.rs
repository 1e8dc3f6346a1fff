//! Shared integration-test harness (design §8.1): a small `Config`, and the
//! guest-instruction encoders the `tests/` crate needs since it only has the
//! public API to build guest binaries with, not the frontend's own decoder.

use dbt_core::Config;

pub mod mocks;

/// Initializes `tracing-subscriber` once per process, the way
/// `TestContext::new` does in the teacher crate — ignores the "already
/// initialized" error so every test file can call this unconditionally.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Initializes the `log`/`env_logger` facade, for tests that want
/// `log::debug!`-style diagnostics rather than `tracing` spans — the exact
/// `TestContext::new` incantation the teacher crate uses.
pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A `Config` with a small RAM region and a tiny code-cache arena, so tests
/// can force cache pressure without compiling thousands of blocks.
#[must_use]
pub fn small_config() -> Config {
    let mut config = Config::default();
    config.address_space.ram_base = 0x1000;
    config.address_space.ram_size = 0x1_0000;
    config
}

/// Guest instruction encoders mirroring `isa::decode`'s bit layout
/// (`major(4) | a(4) | b(4) | c(4)`), kept here rather than in `dbt-core`
/// itself since only tests need to assemble guest code by hand — real guest
/// binaries arrive pre-encoded.
pub mod encode {
    /// `rd = rs1 + rs2`
    #[must_use]
    pub fn add(rd: u16, rs1: u16, rs2: u16) -> u16 {
        (0x0 << 12) | (rd << 8) | (rs1 << 4) | rs2
    }

    /// `rd = rs1 - rs2`
    #[must_use]
    pub fn sub(rd: u16, rs1: u16, rs2: u16) -> u16 {
        (0x1 << 12) | (rd << 8) | (rs1 << 4) | rs2
    }

    /// `rd = rs1 << imm4` (imm4 is an unsigned shift amount, 0-15)
    #[must_use]
    pub fn shli(rd: u16, rs1: u16, imm4: u16) -> u16 {
        (0x8 << 12) | (rd << 8) | (rs1 << 4) | (imm4 & 0xF)
    }

    /// `rd = zext(mem32[rs1])`
    #[must_use]
    pub fn load32(rd: u16, rs1: u16) -> u16 {
        (0xA << 12) | (rd << 8) | (rs1 << 4)
    }

    /// `mem32[rs1] = rs2`
    #[must_use]
    pub fn store32(rs1: u16, rs2: u16) -> u16 {
        (0xB << 12) | (rs1 << 4) | rs2
    }

    /// Branch to `pc + 2 + imm12 * 2` unconditionally.
    #[must_use]
    pub fn bra(imm12: i16) -> u16 {
        (0xD << 12) | (imm12 as u16 & 0x0FFF)
    }

    /// Software trap: forces the interpreter-fallback path.
    #[must_use]
    pub const fn trap() -> u16 {
        0xE << 12
    }

    /// Packs a sequence of guest instructions into little-endian bytes,
    /// ready for `AddressSpace::map_ram`.
    #[must_use]
    pub fn bytes(instrs: &[u16]) -> Vec<u8> {
        instrs.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}
