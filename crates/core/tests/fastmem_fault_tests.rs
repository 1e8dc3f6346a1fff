//! Fastmem fault-and-patch integration test (design §8, scenario 4). Gated
//! to x86_64: the fault handler and the backend it patches are both
//! x86_64-only (design §4.4.1).

#![cfg(target_arch = "x86_64")]

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::encode;
use dbt_core::common::Width;
use dbt_core::{Config, Emulator, GuestAddr};
use pretty_assertions::assert_eq;

#[test]
fn scenario_4_fastmem_site_patches_to_slowmem_on_first_miss() {
    common::init_tracing();

    // The default config's RAM base (0x8c00_0000) is exactly the address
    // scenario 4 names, so the guest code lives where the scenario expects.
    let config = Config::default();
    let ram_base = config.address_space.ram_base;
    let ram_size = config.address_space.ram_size as u32;

    // store32 r0, r1 ; trap  — one fastmem store, then a deterministic
    // block terminator via the interpreter fallback.
    let code = encode::bytes(&[encode::store32(0, 1), encode::trap()]);

    let mmio_writes = Rc::new(RefCell::new(Vec::<(GuestAddr, Width, u64)>::new()));
    let record = Rc::clone(&mmio_writes);
    let read_fn: dbt_core::memory::MmioReadFn = Box::new(|_addr, _width| 0);
    let write_fn: dbt_core::memory::MmioWriteFn =
        Box::new(move |addr, width, value| record.borrow_mut().push((addr, width, value)));

    let mut emu = Emulator::new(config);
    emu.address_space_mut().map_ram(ram_base, ram_base + ram_size, &code).unwrap();
    emu.address_space_mut().map_mmio(0xA000_0000, 0xA000_1000, read_fn, write_fn).unwrap();

    // First run: r0 points inside mapped RAM — the fastmem store succeeds
    // without ever faulting.
    emu.set_pc(GuestAddr::new(ram_base));
    emu.set_guest_register(0, ram_base + 4);
    emu.set_guest_register(1, 0x1234_5678);
    emu.run(1).unwrap();

    assert_eq!(emu.address_space_mut().read32(GuestAddr::new(ram_base + 4)), 0x1234_5678);
    assert_eq!(emu.stats().fastmem_faults_patched, 0);
    assert_eq!(emu.stats().blocks_compiled, 1);

    // Second run through the *same* compiled block (same pc, same flags —
    // no recompilation): r0 now points at the unmapped fastmem range behind
    // the MMIO window, so the same store instruction faults, gets patched
    // to a slowmem call, and the write reaches the MMIO callback instead.
    emu.set_pc(GuestAddr::new(ram_base));
    emu.set_guest_register(0, 0xA000_0000);
    emu.set_guest_register(1, 0x99);
    emu.run(1).unwrap();

    assert_eq!(emu.stats().blocks_compiled, 1, "the faulting site belongs to the already-compiled block");
    assert_eq!(emu.stats().fastmem_faults_patched, 1);
    assert_eq!(*mmio_writes.borrow(), vec![(GuestAddr::new(0xA000_0000), Width::W32, 0x99)]);

    // Re-running once more must not fault again: the site is now
    // permanently a slowmem call (design §4.6 — "subsequent executions use
    // slowmem for that site forever").
    emu.set_pc(GuestAddr::new(ram_base));
    emu.set_guest_register(0, 0xA000_0000);
    emu.set_guest_register(1, 0x55);
    emu.run(1).unwrap();

    assert_eq!(emu.stats().fastmem_faults_patched, 1);
    assert_eq!(mmio_writes.borrow().last(), Some(&(GuestAddr::new(0xA000_0000), Width::W32, 0x55)));
}

#[test]
fn scenario_4b_fastmem_load_site_patches_to_slowmem_and_keeps_its_result() {
    common::init_tracing();

    let config = Config::default();
    let ram_base = config.address_space.ram_base;
    let ram_size = config.address_space.ram_size as u32;

    // load32 r2, r0 ; trap — one fastmem load, whose result must survive a
    // mid-block patch to a slowmem call.
    let code = encode::bytes(&[encode::load32(2, 0), encode::trap()]);

    let read_fn: dbt_core::memory::MmioReadFn = Box::new(|_addr, _width| 0xCAFE_F00D);
    let write_fn: dbt_core::memory::MmioWriteFn = Box::new(|_addr, _width, _value| {});

    let mut emu = Emulator::new(config);
    emu.address_space_mut().map_ram(ram_base, ram_base + ram_size, &code).unwrap();
    emu.address_space_mut().map_mmio(0xA000_0000, 0xA000_1000, read_fn, write_fn).unwrap();
    emu.address_space_mut().write32(GuestAddr::new(ram_base + 4), 0x1122_3344);

    // First run: r0 points inside mapped RAM, the fastmem load succeeds
    // without faulting.
    emu.set_pc(GuestAddr::new(ram_base));
    emu.set_guest_register(0, ram_base + 4);
    emu.run(1).unwrap();

    assert_eq!(emu.guest_registers()[2], 0x1122_3344);
    assert_eq!(emu.stats().fastmem_faults_patched, 0);
    assert_eq!(emu.stats().blocks_compiled, 1);

    // Second run through the same compiled block: r0 now points behind the
    // MMIO window, so the load faults, gets patched to a slowmem call, and
    // the destination register must end up holding the thunk's return value
    // rather than whatever was left in it before the fault.
    emu.set_pc(GuestAddr::new(ram_base));
    emu.set_guest_register(0, 0xA000_0000);
    emu.run(1).unwrap();

    assert_eq!(emu.stats().blocks_compiled, 1, "the faulting site belongs to the already-compiled block");
    assert_eq!(emu.stats().fastmem_faults_patched, 1);
    assert_eq!(emu.guest_registers()[2], 0xCAFE_F00D);

    // Re-running once more must not fault again, and must keep recovering
    // the loaded value correctly through the now-permanent slowmem call.
    emu.set_pc(GuestAddr::new(ram_base));
    emu.set_guest_register(0, 0xA000_0000);
    emu.run(1).unwrap();

    assert_eq!(emu.stats().fastmem_faults_patched, 1);
    assert_eq!(emu.guest_registers()[2], 0xCAFE_F00D);
}
