//! `dbt-sim`: a command-line driver for the `dbt-core` dynamic binary
//! translation engine.
//!
//! One subcommand, mirroring `rvsim`'s `Commands::Run` shape without the
//! Python/gem5-style scripting surface (out of scope for this core):
//! `dbt-sim run --file <path> [--ram-size <bytes>] [--max-steps <n>] [--trace]`.

use std::process;

use clap::{Parser, Subcommand};
use dbt_core::config::Config;
use dbt_core::{Emulator, GuestAddr};

#[derive(Parser, Debug)]
#[command(name = "dbt-sim", author, version, about = "Dynamic binary translation core driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Loads a guest binary and runs it until the stop flag is set or
    /// `--max-steps` blocks have executed.
    Run {
        /// Flat binary or ELF image to load at the configured RAM base.
        #[arg(short, long)]
        file: String,

        /// Guest RAM size in bytes, overriding the default.
        #[arg(long)]
        ram_size: Option<usize>,

        /// Maximum number of compiled blocks to execute before stopping.
        #[arg(long, default_value_t = 1_000_000)]
        max_steps: u64,

        /// Enable `tracing` output for every block compile and cache event.
        #[arg(long)]
        trace: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { file, ram_size, max_steps, trace } => cmd_run(&file, ram_size, max_steps, trace),
    }
}

fn cmd_run(file: &str, ram_size: Option<usize>, max_steps: u64, trace: bool) {
    if trace {
        tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    }

    let mut config = Config::default();
    if let Some(size) = ram_size {
        config.address_space.ram_size = size;
    }

    let image = std::fs::read(file).unwrap_or_else(|err| {
        eprintln!("error reading {file}: {err}");
        process::exit(1);
    });
    let image = load_image(&image, config.address_space.ram_base);

    let ram_base = config.address_space.ram_base;
    let ram_size = config.address_space.ram_size;
    let mut emulator = Emulator::new(config);
    emulator
        .address_space_mut()
        .map_ram(ram_base, ram_base + ram_size as u32, &image)
        .unwrap_or_else(|err| {
            eprintln!("error mapping guest RAM: {err}");
            process::exit(1);
        });
    emulator.set_pc(GuestAddr::new(ram_base));

    if let Err(err) = emulator.run(max_steps) {
        eprintln!("fatal JIT error: {err}");
        println!("{}", emulator.stats().report());
        process::exit(1);
    }

    println!("{}", emulator.stats().report());
}

/// Returns the bytes to load at the guest RAM base: `data` verbatim for a
/// flat binary, or the concatenation of an ELF's loadable segments
/// (relative to `ram_base`) if `data` parses as one.
fn load_image(data: &[u8], ram_base: u32) -> Vec<u8> {
    use object::{Object, ObjectSegment};

    let Ok(elf) = object::File::parse(data) else {
        return data.to_vec();
    };

    let mut highest = 0usize;
    for segment in elf.segments() {
        let end = (segment.address() as u32).wrapping_sub(ram_base) as usize + segment.size() as usize;
        highest = highest.max(end);
    }
    let mut image = vec![0u8; highest];
    for segment in elf.segments() {
        let Ok(bytes) = segment.data() else { continue };
        let offset = (segment.address() as u32).wrapping_sub(ram_base) as usize;
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    image
}
