use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

use galvo_scan::cli::{initialize_logging, load_app_config, set_log_level};
use galvo_scan::config::DaqBackend;
use galvo_scan::raster::reset;

/// Park the galvos after an interrupted scan
#[derive(Parser, Debug)]
#[command(name = "galvo-reset")]
#[command(
    about = "Park both galvo axes, drop the sync line and release the DAQ",
    long_about = None
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Drive the mirrors from the T7's DAC0/DAC1 (0 to 5 V) instead of the LJTick-DAC
    #[arg(long)]
    builtin_dac: bool,

    /// Use the in-memory DAQ instead of the T7
    #[arg(long)]
    simulate: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    initialize_logging(args.log_level.as_deref().unwrap_or("info"))?;

    let mut config = load_app_config(args.config.as_deref())?;
    if args.log_level.is_none() {
        set_log_level(&config.logging.log_level);
    }
    if args.builtin_dac {
        config.use_builtin_dac();
    }
    if args.simulate {
        config.daq.backend = DaqBackend::Simulated;
    }
    config.validate()?;

    let mut daq = config.daq.open()?;
    match reset(&mut daq, &config.daq.channels, &config.dac) {
        Ok(()) => {
            info!("✓ Galvos parked");
            Ok(())
        }
        Err(e) => {
            error!("✗ Reset failed: {e}");
            Err(e.into())
        }
    }
}
