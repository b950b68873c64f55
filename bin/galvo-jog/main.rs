#[cfg(unix)]
mod terminal;

use clap::Parser;
use log::{error, info};
use std::io;
use std::path::PathBuf;

use galvo_scan::cli::{initialize_logging, load_app_config, parse_pair, set_log_level};
use galvo_scan::config::{AppConfig, DaqBackend};
use galvo_scan::jog::JogExit;
use galvo_scan::{DaqInterface, JogController, LineConsole, VoltagePair};

/// Manual galvo positioning from the keyboard
#[derive(Parser, Debug)]
#[command(name = "galvo-jog")]
#[command(about = "Steer the galvo mirrors with the arrow keys", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Use the in-memory DAQ instead of the T7
    #[arg(long)]
    simulate: bool,

    /// Drive the mirrors from the T7's DAC0/DAC1 (0 to 5 V) instead of the LJTick-DAC
    #[arg(long)]
    builtin_dac: bool,

    /// Read one key name per line instead of raw key presses
    #[arg(long)]
    line_mode: bool,

    /// Voltages the mirrors currently sit at, as X,Y
    #[arg(long, value_name = "X,Y", value_parser = parse_pair)]
    start: Option<VoltagePair>,
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
    log_startup_info(&config);

    let daq = config.daq.open()?;
    let mut controller = JogController::new(
        daq,
        config.daq.channels.clone(),
        config.dac,
        config.optics,
    );
    if let Some(start) = args.start {
        controller = controller.with_position(start)?;
    }

    let result = run_session(&mut controller, args.line_mode);
    match &result {
        Ok(JogExit::Restored(pair)) => info!("Returned to {pair}"),
        Ok(JogExit::Held(pair)) => info!("Holding {pair}"),
        Err(e) => error!("Jog session failed: {e}"),
    }
    result.map(|_| ()).map_err(Into::into)
}

fn run_session(
    controller: &mut JogController<Box<dyn DaqInterface>>,
    line_mode: bool,
) -> Result<JogExit, galvo_scan::GalvoError> {
    #[cfg(unix)]
    if !line_mode && terminal::stdin_is_tty() {
        let mut console = terminal::RawTerminal::new()?;
        return controller.run(&mut console);
    }
    #[cfg(not(unix))]
    let _ = line_mode;

    let stdin = io::stdin();
    let mut console = LineConsole::new(stdin.lock(), io::stdout());
    controller.run(&mut console)
}

fn log_startup_info(config: &AppConfig) {
    info!("=== Galvo Jog ===");
    match config.daq.backend {
        DaqBackend::Labjack => info!("T7 at {}:{}", config.daq.address, config.daq.port),
        DaqBackend::Simulated => info!("Simulated DAQ"),
    }
    info!(
        "Galvos on {}/{}, DAC [{}, {}] V at {} bits",
        config.daq.channels.x,
        config.daq.channels.y,
        config.dac.min,
        config.dac.max,
        config.dac.bits
    );
}
