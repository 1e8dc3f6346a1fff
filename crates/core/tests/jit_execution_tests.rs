//! End-to-end JIT compile-and-execute tests (design §8, scenario 3): the
//! frontend decodes, the backend emits real x86_64 machine code, and the
//! dispatcher calls into it directly. Gated to x86_64: there is no backend
//! for any other target (design §4.4.1).

#![cfg(target_arch = "x86_64")]

mod common;

use common::encode;
use dbt_core::{Emulator, GuestAddr};
use pretty_assertions::assert_eq;

#[test]
fn scenario_3_arithmetic_and_shift_then_unconditional_branch() {
    common::init_tracing();
    let config = common::small_config();
    let ram_base = config.address_space.ram_base;

    // r1 = r2 + r3
    // r2 = r1 << 2
    // bra +3 (target = pc_of_bra + 2 + 3*2)
    let code = encode::bytes(&[
        encode::add(1, 2, 3),
        encode::shli(2, 1, 2),
        encode::bra(3),
    ]);

    let mut emu = Emulator::new(config.clone());
    emu.address_space_mut()
        .map_ram(ram_base, ram_base + config.address_space.ram_size as u32, &code)
        .unwrap();
    emu.set_pc(GuestAddr::new(ram_base));
    emu.set_guest_register(2, 1);
    emu.set_guest_register(3, 2);

    emu.run(1).unwrap();

    assert_eq!(emu.guest_registers()[1], 3);
    assert_eq!(emu.guest_registers()[2], 12);

    let bra_addr = ram_base + 4;
    let expected_pc = bra_addr + 2 + 3 * 2;
    assert_eq!(emu.pc(), GuestAddr::new(expected_pc));
    assert_eq!(emu.stats().blocks_compiled, 1);
}

#[test]
fn recompiled_block_is_served_from_cache_on_the_second_hit() {
    common::init_tracing();
    let config = common::small_config();
    let ram_base = config.address_space.ram_base;

    // A tight self-loop: add r0,r0,r1 ; bra -2 (back to the add).
    let code = encode::bytes(&[encode::add(0, 0, 1), encode::bra(-2)]);

    let mut emu = Emulator::new(config.clone());
    emu.address_space_mut()
        .map_ram(ram_base, ram_base + config.address_space.ram_size as u32, &code)
        .unwrap();
    emu.set_pc(GuestAddr::new(ram_base));
    emu.set_guest_register(1, 1);

    emu.run(5).unwrap();

    assert_eq!(emu.guest_registers()[0], 5);
    assert_eq!(emu.stats().blocks_compiled, 1, "same (pc, flags) key every iteration — one compile, four cache hits");
    assert_eq!(emu.stats().cache_hits, 4);
}
