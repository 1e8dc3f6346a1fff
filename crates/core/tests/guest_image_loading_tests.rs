//! Loading a guest flat binary from disk (design §8.1 ambient tooling):
//! mirrors what `dbt-sim run --file` does before handing bytes to
//! `AddressSpace::map_ram`, at the level `dbt-core` itself owns — reading
//! an image and mapping it, without the CLI's ELF-vs-flat detection.

mod common;

use std::io::Write;

use common::encode;
use dbt_core::config::AddressSpaceConfig;
use dbt_core::memory::AddressSpace;
use pretty_assertions::assert_eq;

#[test]
fn image_written_to_a_tempfile_loads_and_executes_identically_to_inline_bytes() {
    common::init_tracing();

    let code = encode::bytes(&[encode::add(1, 2, 3), encode::trap()]);

    let mut file = tempfile::NamedTempFile::new().expect("create temp guest image");
    file.write_all(&code).expect("write guest image");
    file.flush().expect("flush guest image");

    let loaded = std::fs::read(file.path()).expect("read guest image back");
    assert_eq!(loaded, code);

    let config = AddressSpaceConfig::default();
    let ram_base = config.ram_base;
    let ram_size = config.ram_size as u32;
    let mut mem = AddressSpace::new(&config);
    mem.map_ram(ram_base, ram_base + ram_size, &loaded).unwrap();

    assert_eq!(mem.read16(dbt_core::GuestAddr::new(ram_base)), encode::add(1, 2, 3));
    assert_eq!(mem.read16(dbt_core::GuestAddr::new(ram_base + 2)), encode::trap());
}
