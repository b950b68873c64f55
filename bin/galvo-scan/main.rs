use chrono::Utc;
use clap::Parser;
use crossbeam_channel::{Receiver, unbounded};
use log::{error, info, warn};
use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use galvo_scan::cli::{initialize_logging, load_app_config, parse_pair, set_log_level};
use galvo_scan::config::{AppConfig, DaqBackend};
use galvo_scan::{
    EventLog, GalvoError, RasterDriver, RasterMode, ScanEvent, ScanPlan, ScanPlanner,
    SimulatedCounter, VoltagePair, acquire, brightest_row, gaussian_spot, plot_row_profile,
    render_heatmap,
};

/// Galvo raster scan with photon counting
#[derive(Parser, Debug)]
#[command(name = "galvo-scan")]
#[command(about = "Raster the galvo mirrors over a field and image the counts", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Field width in micrometres
    #[arg(long)]
    width: Option<f64>,

    /// Field height in micrometres
    #[arg(long)]
    height: Option<f64>,

    /// Pixel pitch in DAC quanta
    #[arg(long)]
    spacing: Option<u32>,

    /// Dwell per pixel in microseconds
    #[arg(long)]
    integration_us: Option<f64>,

    /// Drive the mirrors from the T7's DAC0/DAC1 (0 to 5 V) instead of the LJTick-DAC
    #[arg(long)]
    builtin_dac: bool,

    /// Serpentine raster instead of sawtooth
    #[arg(long)]
    square: bool,

    /// Dwell 100x longer on the first pixel of each row
    #[arg(long)]
    edge_check: bool,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<f64>,

    /// Use the in-memory DAQ instead of the T7
    #[arg(long)]
    simulate: bool,

    /// Print the plan and exit without moving the mirrors
    #[arg(long)]
    plan_only: bool,

    /// Position of the simulated emitter, as X,Y volts
    #[arg(long, value_name = "X,Y", default_value = "0,0", value_parser = parse_pair)]
    spot: VoltagePair,

    /// Write the image as a 16-bit PNG
    #[arg(long, value_name = "FILE")]
    png: Option<PathBuf>,

    /// Write counts and scan statistics as JSON
    #[arg(long, value_name = "FILE")]
    json: Option<PathBuf>,

    /// Skip the terminal heatmap
    #[arg(long)]
    quiet: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    initialize_logging(args.log_level.as_deref().unwrap_or("info"))?;

    let config = apply_overrides(load_app_config(args.config.as_deref())?, &args);
    if args.log_level.is_none() {
        set_log_level(&config.logging.log_level);
    }
    config.validate()?;

    let planner = ScanPlanner::new(config.optics, config.dac);
    let plan = planner.plan_config(&config.scan)?;
    log_plan(&config, &plan);
    if args.plan_only {
        return Ok(());
    }

    let shutdown_flag = setup_shutdown_handler()?;

    let (log_tx, recorder) = if config.logging.event_logging {
        let (log_tx, log_rx) = unbounded();
        (Some(log_tx), Some(spawn_event_log(&config, log_rx)?))
    } else {
        (None, None)
    };

    let (counter_tx, counter_rx) = unbounded();
    let mut driver = RasterDriver::new(
        config.daq.open()?,
        config.daq.channels.clone(),
        config.dac,
        config.scan.clone(),
        plan,
    )
    .with_event_sender(counter_tx)
    .with_cancel_flag(shutdown_flag.clone());
    if let Some(log_tx) = log_tx {
        driver = driver.with_event_sender(log_tx);
    }

    if config.daq.backend == DaqBackend::Labjack {
        warn!("No counting instrument driver is available, counts are simulated");
    }
    let sigma = 3.0 * plan.step_v;
    let spot = gaussian_spot(args.spot, sigma, 1.0e6, 1.0e3);
    let mut counter = SimulatedCounter::new(counter_rx, spot);
    let gate = config.counter.gate(config.scan.integration_time());
    let timeout = args.timeout.map(Duration::from_secs_f64);

    let mut last_report = 0.0;
    let result = acquire(
        driver,
        &mut counter,
        &gate,
        config.counter.poll_interval(),
        timeout,
        |image| {
            let total = image.stats().total;
            if total != last_report {
                info!("{total} counts so far");
                last_report = total;
            }
        },
    );

    if let Some(recorder) = recorder {
        match recorder.join() {
            Ok(Ok(count)) => info!("Event log holds {count} records"),
            Ok(Err(e)) => error!("Event log failed: {e}"),
            Err(_) => error!("Event log thread panicked"),
        }
    }

    let acquisition = match result {
        Ok(acquisition) => acquisition,
        Err(e) => {
            error!("✗ Scan failed: {e}");
            return Err(e.into());
        }
    };

    let stats = &acquisition.stats;
    if shutdown_flag.load(Ordering::SeqCst) || stats.cancelled {
        info!("✓ Scan stopped by user after {} pixels", stats.pixels_visited);
    } else {
        info!(
            "✓ Scan complete: {} pixels in {:.2} s, worst dwell overrun {} us",
            stats.pixels_visited,
            stats.elapsed.as_secs_f64(),
            stats.max_overrun.as_micros()
        );
    }

    let image = &acquisition.image;
    if !args.quiet {
        print!("{}", render_heatmap(image, 100));
        if let Some(row) = brightest_row(image) {
            if let Err(e) = plot_row_profile(image, row, None, None) {
                warn!("Skipping profile plot: {e}");
            }
        }
    }
    if let Some(path) = &args.png {
        image.save_png(path)?;
    }
    if let Some(path) = &args.json {
        image.save_json(path, Some(stats))?;
        info!("Saved counts to {}", path.display());
    }
    Ok(())
}

fn apply_overrides(mut config: AppConfig, args: &Args) -> AppConfig {
    if args.builtin_dac {
        config.use_builtin_dac();
    }
    if let Some(width) = args.width {
        config.scan.width_um = width;
    }
    if let Some(height) = args.height {
        config.scan.height_um = height;
    }
    if let Some(spacing) = args.spacing {
        config.scan.spacing = spacing;
    }
    if let Some(us) = args.integration_us {
        config.scan.integration_time_us = us;
    }
    if args.square {
        config.scan.mode = RasterMode::Square;
    }
    if args.edge_check {
        config.scan.edge_check = true;
    }
    if args.simulate {
        config.daq.backend = DaqBackend::Simulated;
        config.scan.settle_time_ms = config.scan.settle_time_ms.min(100);
    }
    config
}

fn log_plan(config: &AppConfig, plan: &ScanPlan) {
    info!("=== Galvo Scan ===");
    info!(
        "Field {} x {} um, spacing {} quanta ({:.6} V per pixel)",
        config.scan.width_um, config.scan.height_um, plan.spacing, plan.step_v
    );
    info!(
        "x ±{:.6} V in {} pixels, y ±{:.6} V in {} pixels",
        plan.x.half_range_v, plan.x.pixels, plan.y.half_range_v, plan.y.pixels
    );
    let dwell = config.scan.integration_time().as_secs_f64();
    info!(
        "{} raster, {} us dwell, about {:.1} s of integration",
        config.scan.mode,
        config.scan.integration_time_us,
        dwell * plan.pixel_count() as f64
    );
}

/// Record scan events to a timestamped JSONL file on a background thread
fn spawn_event_log(
    config: &AppConfig,
    events: Receiver<ScanEvent>,
) -> Result<thread::JoinHandle<Result<usize, GalvoError>>, GalvoError> {
    fs::create_dir_all(&config.logging.log_path).map_err(|source| GalvoError::Io {
        source,
        context: format!("Could not create log directory {}", config.logging.log_path),
    })?;
    let stem = format!("scan_{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let path = config.logging.event_log_file(&stem);
    info!("Recording scan events to {}", path.display());

    let mut log = EventLog::new(path, config.logging.buffer_size);
    thread::Builder::new()
        .name("event-log".to_string())
        .spawn(move || log.record_until_closed(events))
        .map_err(|e| GalvoError::Worker(format!("could not start event log thread: {e}")))
}

fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, Box<dyn std::error::Error>> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping scan and parking mirrors...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}
