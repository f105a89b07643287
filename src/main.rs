//! veilcrypt device simulator
//!
//! Drives a full device lifecycle over a file-backed image, showcasing:
//! - Hidden-sector writes fanned out across carrier IV slots
//! - Public traffic crossing live carriers without destroying them
//! - Reboot survival via the persistent tree and the recovery scan
//!
//! Run with: cargo run --release -- --sectors 16384

use std::sync::Arc;

use clap::{ArgAction, Parser};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use veilcrypt::config::SECTOR_SIZE;
use veilcrypt::{CryptDevice, DeviceParams, FileDevice, MetricsSnapshot};

/// Command-line arguments for the device simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backing image path (created fresh unless --keep-image)
    #[arg(long, default_value = "veilcrypt-sim.img")]
    image: String,

    /// Device size in 512-byte sectors
    #[arg(long, default_value_t = 16384)]
    sectors: u64,

    /// Hidden logical sectors to write
    #[arg(long, default_value_t = 8)]
    hidden_sectors: u32,

    /// Public sectors to write as interfering traffic
    #[arg(long, default_value_t = 64)]
    public_writes: u64,

    /// Order of the persistent map tree (3..=20)
    #[arg(long, default_value_t = 16)]
    tree_order: usize,

    /// Reopen an existing image instead of creating a fresh one
    #[arg(long, default_value_t = false)]
    keep_image: bool,

    /// Random seed for the workload
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Print a machine-readable JSON summary at the end
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Increase output verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    sectors: u64,
    hidden_sectors_written: u32,
    public_sectors_written: u64,
    hidden_verified_before_reboot: bool,
    hidden_verified_after_reboot: bool,
    metrics: MetricsSnapshot,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("veilcrypt={default}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn hidden_pattern(rng_seed: u64, logical: u32) -> [u8; SECTOR_SIZE] {
    let mut rng = StdRng::seed_from_u64(rng_seed ^ u64::from(logical));
    let mut data = [0u8; SECTOR_SIZE];
    rng.fill_bytes(&mut data);
    data
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    info!("");
    info!("╔══════════════════════════════════════════════════════════════╗");
    info!("║   veilcrypt device simulator                                 ║");
    info!("║   Hidden sectors, carrier preservation, recovery             ║");
    info!("╚══════════════════════════════════════════════════════════════╝");
    info!("");

    if let Err(err) = run(&cli) {
        error!("simulation failed: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> veilcrypt::Result<()> {
    let mut key_rng = StdRng::seed_from_u64(cli.seed);
    let mut key_bytes = [0u8; 64];
    key_rng.fill_bytes(&mut key_bytes);
    let key_hex = hex::encode(key_bytes);
    let tree_order = format!("tree_order:{}", cli.tree_order);
    let table: Vec<&str> = vec![
        "aes-cbc-plain64",
        key_hex.as_str(),
        "0",
        cli.image.as_str(),
        "0",
        "2",
        "store_data_in_integrity_md:16",
        tree_order.as_str(),
    ];

    // Phase 1: construction
    info!("[1/4] Construction");
    let backing = if cli.keep_image {
        FileDevice::open(&cli.image)?
    } else {
        FileDevice::create(&cli.image, cli.sectors)?
    };
    let params = DeviceParams::parse(&table)?;
    let device = CryptDevice::open(params.clone(), Arc::new(backing))?;
    info!(
        "  ✓ device online: {} sectors, {} free carriers",
        cli.sectors,
        device.free_sector_count()
    );
    info!("");

    // Phase 2: hidden writes
    info!("[2/4] Hidden writes");
    for logical in 0..cli.hidden_sectors {
        let data = hidden_pattern(cli.seed, logical);
        device.hidden_write(logical, &data)?;
    }
    info!(
        "  ✓ wrote {} hidden sectors ({} carriers each)",
        cli.hidden_sectors,
        CryptDevice::carriers_per_hidden()
    );
    info!("");

    // Phase 3: interfering public traffic, then verification
    info!("[3/4] Public interference");
    let mut rng = StdRng::seed_from_u64(cli.seed.wrapping_add(1));
    let mut payload = vec![0u8; SECTOR_SIZE];
    for _ in 0..cli.public_writes {
        let sector = rng.gen_range(0..cli.sectors);
        rng.fill_bytes(&mut payload);
        device.public_write(sector, &payload)?;
        let mut back = vec![0u8; SECTOR_SIZE];
        device.public_read(sector, &mut back)?;
        if back != payload {
            error!("public round-trip mismatch at sector {sector}");
        }
    }
    let verified_before = verify_hidden(&device, cli)?;
    info!(
        "  ✓ {} public writes; hidden namespace {}",
        cli.public_writes,
        if verified_before { "intact" } else { "DAMAGED" }
    );
    info!("");

    // Phase 4: reboot and recovery
    info!("[4/4] Reboot and recovery");
    drop(device);
    let reopened = FileDevice::open(&cli.image)?;
    let device = CryptDevice::open(params, Arc::new(reopened))?;
    let verified_after = verify_hidden(&device, cli)?;
    info!(
        "  ✓ recovered map has {} tree entries; hidden namespace {}",
        device.tree_entries()?.len(),
        if verified_after { "intact" } else { "DAMAGED" }
    );
    info!("");

    let metrics = device.metrics();
    info!("Final counters:");
    for line in metrics.format_table().lines() {
        info!("{line}");
    }

    if cli.json {
        let summary = RunSummary {
            sectors: cli.sectors,
            hidden_sectors_written: cli.hidden_sectors,
            public_sectors_written: cli.public_writes,
            hidden_verified_before_reboot: verified_before,
            hidden_verified_after_reboot: verified_after,
            metrics,
        };
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{json}"),
            Err(err) => error!("summary serialization failed: {err}"),
        }
    }
    Ok(())
}

fn verify_hidden(device: &CryptDevice, cli: &Cli) -> veilcrypt::Result<bool> {
    let mut all_good = true;
    for logical in 0..cli.hidden_sectors {
        let expected = hidden_pattern(cli.seed, logical);
        let mut actual = [0u8; SECTOR_SIZE];
        device.hidden_read(logical, &mut actual)?;
        if actual != expected {
            error!("hidden sector {logical} mismatch");
            all_good = false;
        }
    }
    Ok(all_good)
}
