//! `mockall`-based `Device` mocks for bus-routing tests (design §8.1).

use dbt_core::common::{GuestAddr, Width};
use dbt_core::device::Device;
use mockall::mock;

mock! {
    /// A mocked device whose `address_range` and access methods are set
    /// per-test via `.expect_*()`, standing in for a real peripheral when
    /// the test cares about `Bus` routing, not device semantics.
    pub RecordingDevice {}

    impl Device for RecordingDevice {
        fn name(&self) -> &str;
        fn address_range(&self) -> (GuestAddr, u32);
        fn read8(&mut self, offset: u32) -> u8;
        fn read16(&mut self, offset: u32) -> u16;
        fn read32(&mut self, offset: u32) -> u32;
        fn read64(&mut self, offset: u32) -> u64;
        fn write8(&mut self, offset: u32, value: u8);
        fn write16(&mut self, offset: u32, value: u16);
        fn write32(&mut self, offset: u32, value: u32);
        fn write64(&mut self, offset: u32, value: u64);
        fn tick(&mut self) -> bool;
        fn irq_id(&self) -> Option<u32>;
    }
}
