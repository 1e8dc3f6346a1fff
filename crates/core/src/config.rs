//! Configuration for the dynamic binary translation core.
//!
//! This module defines the configuration structures used to parameterize the
//! emulator. It provides:
//! 1. **Defaults:** Baseline constants (guest RAM geometry, code cache
//!    arena size, block-length limit).
//! 2. **Structures:** Hierarchical config for general settings, the guest
//!    address space, the code cache, and the one device this core ships.
//!
//! Configuration is supplied as JSON (e.g. from a future scripting front end)
//! or use `Config::default()` for the CLI.

use serde::Deserialize;

/// Default configuration constants.
///
/// These values define the baseline configuration when not explicitly
/// overridden by a deserialized `Config`.
mod defaults {
    /// Base address of guest RAM in the 32-bit guest address space.
    pub const RAM_BASE: u32 = 0x8c00_0000;

    /// Size of guest RAM in bytes (16 MiB, matching the Dreamcast's main RAM).
    pub const RAM_SIZE: usize = 16 * 1024 * 1024;

    /// Size of the fastmem arena in bytes.
    ///
    /// Must be at least large enough to mirror the full 32-bit guest space
    /// so that every `Ram`/`Rom` region, wherever based, lands inside it at
    /// its identity offset (design §4.1 invariant).
    pub const FASTMEM_ARENA_SIZE: usize = 1usize << 32;

    /// Page table granularity: 12-bit page offset, matching a 4 KiB page.
    pub const PAGE_BITS: u32 = 12;

    /// Default executable-code arena size (4 MiB).
    pub const CODE_CACHE_SIZE: usize = 4 * 1024 * 1024;

    /// Default maximum guest instructions per compiled block (design §4.5).
    pub const MAX_BLOCK_LEN: usize = 256;

    /// Default base address of the illustrative serial port device (§6).
    pub const SERIAL_BASE: u32 = 0xa050_0000;
}

/// Root configuration structure containing all JIT core settings.
///
/// # Examples
///
/// Creating a default configuration:
///
/// ```
/// use dbt_core::config::Config;
///
/// let config = Config::default();
/// assert_eq!(config.general.trace, false);
/// assert_eq!(config.code_cache.max_block_len, 256);
/// ```
///
/// Deserializing from JSON:
///
/// ```
/// use dbt_core::config::Config;
///
/// let json = r#"{
///     "general": { "trace": true },
///     "address_space": { "ram_base": 2348810240, "ram_size": 16777216 },
///     "code_cache": { "arena_size": 1048576, "max_block_len": 64 },
///     "device": { "serial_base": 2686361600 }
/// }"#;
///
/// let config: Config = serde_json::from_str(json).unwrap();
/// assert_eq!(config.general.trace, true);
/// assert_eq!(config.code_cache.max_block_len, 64);
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// General settings (tracing, etc.)
    #[serde(default)]
    pub general: GeneralConfig,
    /// Guest address space geometry.
    #[serde(default)]
    pub address_space: AddressSpaceConfig,
    /// Code cache / executable arena settings.
    #[serde(default)]
    pub code_cache: CodeCacheConfig,
    /// The one concrete device this core ships (§6).
    #[serde(default)]
    pub device: DeviceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            address_space: AddressSpaceConfig::default(),
            code_cache: CodeCacheConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

/// General settings controlling diagnostics.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Enable `tracing` spans/events for every block compile and cache
    /// event. Off by default; the `always-trace` feature forces it on even
    /// when this is false.
    #[serde(default)]
    pub trace: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { trace: false }
    }
}

/// Guest address space geometry.
#[derive(Debug, Clone, Deserialize)]
pub struct AddressSpaceConfig {
    /// Base address of guest RAM.
    #[serde(default = "AddressSpaceConfig::default_ram_base")]
    pub ram_base: u32,
    /// Size of guest RAM in bytes.
    #[serde(default = "AddressSpaceConfig::default_ram_size")]
    pub ram_size: usize,
    /// Size of the fastmem arena in bytes. Must cover the full guest space.
    #[serde(default = "AddressSpaceConfig::default_fastmem_arena_size")]
    pub fastmem_arena_size: usize,
    /// Page table granularity in bits (12 = 4 KiB pages).
    #[serde(default = "AddressSpaceConfig::default_page_bits")]
    pub page_bits: u32,
}

impl AddressSpaceConfig {
    const fn default_ram_base() -> u32 {
        defaults::RAM_BASE
    }
    const fn default_ram_size() -> usize {
        defaults::RAM_SIZE
    }
    const fn default_fastmem_arena_size() -> usize {
        defaults::FASTMEM_ARENA_SIZE
    }
    const fn default_page_bits() -> u32 {
        defaults::PAGE_BITS
    }
}

impl Default for AddressSpaceConfig {
    fn default() -> Self {
        Self {
            ram_base: Self::default_ram_base(),
            ram_size: Self::default_ram_size(),
            fastmem_arena_size: Self::default_fastmem_arena_size(),
            page_bits: Self::default_page_bits(),
        }
    }
}

/// Code cache / executable arena settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CodeCacheConfig {
    /// Size of the executable code arena in bytes.
    #[serde(default = "CodeCacheConfig::default_arena_size")]
    pub arena_size: usize,
    /// Maximum number of guest instructions translated into a single block
    /// before the frontend forces a terminator (design §4.5).
    #[serde(default = "CodeCacheConfig::default_max_block_len")]
    pub max_block_len: usize,
}

impl CodeCacheConfig {
    const fn default_arena_size() -> usize {
        defaults::CODE_CACHE_SIZE
    }
    const fn default_max_block_len() -> usize {
        defaults::MAX_BLOCK_LEN
    }
}

impl Default for CodeCacheConfig {
    fn default() -> Self {
        Self {
            arena_size: Self::default_arena_size(),
            max_block_len: Self::default_max_block_len(),
        }
    }
}

/// Settings for the illustrative serial port device (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Base address of the serial port's MMIO window.
    #[serde(default = "DeviceConfig::default_serial_base")]
    pub serial_base: u32,
}

impl DeviceConfig {
    const fn default_serial_base() -> u32 {
        defaults::SERIAL_BASE
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial_base: Self::default_serial_base(),
        }
    }
}
