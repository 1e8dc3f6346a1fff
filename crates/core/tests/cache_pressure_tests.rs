//! Code-cache overflow-and-reset integration test (design §8, scenario 5).

#![cfg(target_arch = "x86_64")]

mod common;

use common::encode;
use dbt_core::{Config, Emulator, GuestAddr};

#[test]
fn scenario_5_arena_overflow_resets_the_cache_and_stale_keys_recompile() {
    common::init_tracing();
    common::init_log();

    let mut config = Config::default();
    config.address_space.ram_base = 0x1000;
    config.address_space.ram_size = 0x10_0000;
    // Rounds up to one page internally, but is still far too small to hold
    // every block this test compiles without at least one reset.
    config.code_cache.arena_size = 64;

    let ram_base = config.address_space.ram_base;

    // 200 distinct single-instruction blocks, each 2 bytes of guest code
    // apart, each trivially its own (pc, flags) cache key.
    const N: u32 = 200;
    let mut code = Vec::new();
    for _ in 0..N {
        code.extend_from_slice(&encode::trap().to_le_bytes());
    }

    let mut emu = Emulator::new(config.clone());
    emu.address_space_mut().map_ram(ram_base, ram_base + config.address_space.ram_size as u32, &code).unwrap();

    for i in 0..N {
        emu.set_pc(GuestAddr::new(ram_base + i * 2));
        emu.run(1).unwrap();
        log::debug!("compiled block {i}, resets so far = {}", emu.stats().cache_resets);
    }

    assert_eq!(emu.stats().blocks_compiled, u64::from(N));
    assert!(emu.stats().cache_resets >= 1, "a 64-byte arena cannot hold 200 blocks without resetting");

    // The very first block compiled is almost certainly gone after a reset;
    // looking it up again must miss and recompile cleanly rather than
    // returning a dangling pointer into a freed arena.
    let resets_before = emu.stats().cache_resets;
    let compiled_before = emu.stats().blocks_compiled;
    emu.set_pc(GuestAddr::new(ram_base));
    emu.run(1).unwrap();

    assert_eq!(emu.stats().blocks_compiled, compiled_before + 1, "a block evicted by reset recompiles on next use");
    assert_eq!(emu.stats().cache_resets, resets_before, "recompiling into room already freed doesn't force another reset");
}
