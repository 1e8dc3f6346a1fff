//! `AddressSpace` integration tests (design §8, scenario 1 and the
//! read/write quantified invariant).

mod common;

use dbt_core::common::{GuestAddr, Width};
use dbt_core::config::AddressSpaceConfig;
use dbt_core::memory::AddressSpace;
use pretty_assertions::assert_eq;
use rstest::rstest;

fn fresh_space() -> AddressSpace {
    common::init_tracing();
    AddressSpace::new(&AddressSpaceConfig::default())
}

#[test]
fn scenario_1_byte_order_round_trip() {
    let mut mem = fresh_space();
    mem.map_ram(0x0000_0000, 0x0100_0000, &[]).unwrap();

    mem.write32(GuestAddr::new(0x40), 0xDEAD_BEEF);

    assert_eq!(mem.read8(GuestAddr::new(0x40)), 0xEF);
    assert_eq!(mem.read8(GuestAddr::new(0x43)), 0xDE);
}

#[test]
fn map_ram_copies_initial_bytes_and_zero_pads_the_rest() {
    let mut mem = fresh_space();
    mem.map_ram(0x1000, 0x2000, &[1, 2, 3, 4]).unwrap();

    assert_eq!(mem.read32(GuestAddr::new(0x1000)), 0x0403_0201);
    assert_eq!(mem.read32(GuestAddr::new(0x1ffc)), 0);
}

#[test]
fn overlapping_map_ram_is_rejected() {
    let mut mem = fresh_space();
    mem.map_ram(0x1000, 0x2000, &[]).unwrap();
    let err = mem.map_ram(0x1800, 0x2800, &[]).unwrap_err();
    assert!(matches!(err, dbt_core::JitError::OverlapError { .. }));
}

#[test]
fn rom_writes_are_discarded_not_fatal() {
    let mut mem = fresh_space();
    mem.map_rom(0x1000, 0x2000, &[0xAA; 4]).unwrap();

    mem.write32(GuestAddr::new(0x1000), 0xFFFF_FFFF);

    assert_eq!(mem.read32(GuestAddr::new(0x1000)), 0xAAAA_AAAA);
}

#[test]
fn unmapped_read_returns_zero_and_unmapped_write_is_discarded() {
    let mut mem = fresh_space();
    assert_eq!(mem.read32(GuestAddr::new(0x5000_0000)), 0);
    mem.write32(GuestAddr::new(0x5000_0000), 0x1234); // must not panic
    assert_eq!(mem.read32(GuestAddr::new(0x5000_0000)), 0);
}

#[rstest]
#[case(Width::W8, 0x0000_00AB_u64)]
#[case(Width::W16, 0x0000_ABCD_u64)]
#[case(Width::W32, 0xDEAD_BEEF_u64)]
#[case(Width::W64, 0x0123_4567_89AB_CDEF_u64)]
fn ram_round_trips_every_width(#[case] width: Width, #[case] value: u64) {
    let mut mem = fresh_space();
    mem.map_ram(0x1000, 0x2000, &[]).unwrap();
    let addr = GuestAddr::new(0x1000);

    match width {
        Width::W8 => mem.write8(addr, value as u8),
        Width::W16 => mem.write16(addr, value as u16),
        Width::W32 => mem.write32(addr, value as u32),
        Width::W64 => mem.write64(addr, value),
    }

    let got = match width {
        Width::W8 => u64::from(mem.read8(addr)),
        Width::W16 => u64::from(mem.read16(addr)),
        Width::W32 => u64::from(mem.read32(addr)),
        Width::W64 => mem.read64(addr),
    };
    assert_eq!(got, value);
}
