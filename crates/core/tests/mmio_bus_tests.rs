//! MMIO dispatch and `Bus` routing tests (design §8, scenario 2).

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::mocks::MockRecordingDevice;
use dbt_core::common::{GuestAddr, Width};
use dbt_core::config::AddressSpaceConfig;
use dbt_core::device::{Bus, SerialPort};
use dbt_core::memory::AddressSpace;
use pretty_assertions::assert_eq;

#[test]
fn scenario_2_mmio_counting_read_is_called_exactly_once_per_access() {
    common::init_tracing();
    let mut mem = AddressSpace::new(&AddressSpaceConfig::default());

    let calls = Rc::new(Cell::new(0u32));
    let read_calls = Rc::clone(&calls);
    let read_fn: dbt_core::memory::MmioReadFn = Box::new(move |_addr, _width| {
        let n = read_calls.get();
        read_calls.set(n + 1);
        u64::from(n)
    });
    let write_fn: dbt_core::memory::MmioWriteFn = Box::new(|_addr, _width, _value| {});

    mem.map_mmio(0xA000_0000, 0xA000_1000, read_fn, write_fn).unwrap();

    let addr = GuestAddr::new(0xA000_0000);
    assert_eq!(mem.read32(addr), 0);
    assert_eq!(mem.read32(addr), 1);
    assert_eq!(mem.read32(addr), 2);
    assert_eq!(calls.get(), 3);
}

#[test]
fn bus_routes_to_the_device_whose_range_contains_the_address() {
    common::init_tracing();

    let mut low = MockRecordingDevice::new();
    low.expect_name().return_const("low");
    low.expect_address_range().return_const((GuestAddr::new(0x1000), 0x10));
    low.expect_read32().withf(|off| *off == 0x4).returning(|_| 0x1111_1111);

    let mut high = MockRecordingDevice::new();
    high.expect_name().return_const("high");
    high.expect_address_range().return_const((GuestAddr::new(0x2000), 0x10));
    high.expect_read32().withf(|off| *off == 0x4).returning(|_| 0x2222_2222);

    let mut bus = Bus::new();
    bus.add_device(Box::new(low));
    bus.add_device(Box::new(high));

    assert_eq!(bus.read(GuestAddr::new(0x1004), Width::W32), 0x1111_1111);
    assert_eq!(bus.read(GuestAddr::new(0x2004), Width::W32), 0x2222_2222);
}

#[test]
fn bus_write_to_unclaimed_address_is_discarded_not_fatal() {
    common::init_tracing();
    let mut device = MockRecordingDevice::new();
    device.expect_name().return_const("only");
    device.expect_address_range().return_const((GuestAddr::new(0x1000), 0x10));
    device.expect_write32().times(0);

    let mut bus = Bus::new();
    bus.add_device(Box::new(device));

    bus.write(GuestAddr::new(0x9000), Width::W32, 0xFF); // must not panic, must not reach `device`
}

#[test]
fn serial_port_is_a_working_bus_device() {
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;

    common::init_tracing();
    let input = Arc::new(AtomicU8::new(b'x'));
    let read_input = Arc::clone(&input);
    let captured = Arc::new(AtomicU8::new(0));
    let write_captured = Arc::clone(&captured);

    let port = SerialPort::new(
        GuestAddr::new(0xa050_0000),
        move || read_input.load(Ordering::Relaxed),
        move |b| write_captured.store(b, Ordering::Relaxed),
    );

    let mut bus = Bus::new();
    bus.add_device(Box::new(port));

    assert_eq!(bus.read(GuestAddr::new(0xa050_0000), Width::W8), u64::from(b'x'));
    bus.write(GuestAddr::new(0xa050_0000), Width::W8, u64::from(b'!'));
    assert_eq!(captured.load(Ordering::Relaxed), b'!');
}
