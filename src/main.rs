//! Oxidized-Xenon - Xbox 360 CPU emulator
//!
//! Main entry point for the emulator application.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use ox_core::{Config, SystemSignals};
use ox_cpu::Xenon;
use ox_memory::constants::{PCI_BRIDGE_BASE, PCI_BRIDGE_SIZE};
use ox_memory::DeviceInfo;
use ox_pci::PciBridge;

const USAGE: &str = "usage: oxidized-xenon [--help] [config.toml]";

fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = match &config_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    ox_core::logging::init(&config);

    tracing::info!("Starting Oxidized-Xenon");

    let signals = SystemSignals::new();
    let mut xenon = Xenon::new(&config, Arc::clone(&signals))?;

    let revision_id = match config.system.revision {
        ox_core::config::ConsoleRevision::Xenon => 0x02,
        ox_core::config::ConsoleRevision::Zephyr
        | ox_core::config::ConsoleRevision::Falcon
        | ox_core::config::ConsoleRevision::Jasper
        | ox_core::config::ConsoleRevision::Trinity => 0x60,
        _ => 0x90,
    };
    let bridge = PciBridge::new(Arc::clone(xenon.iic()), PCI_BRIDGE_BASE, revision_id);
    xenon
        .space()
        .register_device(
            DeviceInfo {
                name: "PCI-Bridge".into(),
                start: PCI_BRIDGE_BASE,
                end: PCI_BRIDGE_BASE + PCI_BRIDGE_SIZE - 1,
                soc_device: false,
            },
            Arc::new(parking_lot::Mutex::new(bridge)),
        )
        .map_err(ox_core::error::EmulatorError::from)?;

    xenon.start();
    xenon.wait_for_shutdown();
    xenon.shutdown();
    Ok(())
}

fn main() {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    for arg in &mut args {
        match arg.as_str() {
            "--help" | "-h" => {
                println!("{USAGE}");
                return;
            }
            _ if config_path.is_none() => config_path = Some(PathBuf::from(arg)),
            _ => {
                eprintln!("{USAGE}");
                std::process::exit(-1);
            }
        }
    }

    if let Err(err) = run(config_path) {
        eprintln!("fatal: {err:#}");
        std::process::exit(-1);
    }
}
