use image::{ImageBuffer, Luma};
use log::{debug, info, warn};
use ndarray::Array2;
use serde::Serialize;
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::counter::{CountingInstrument, GateConfig};
use crate::error::GalvoError;
use crate::job::Job;
use crate::labjack::DaqInterface;
use crate::raster::{RasterDriver, ScanStats};
use crate::types::{RasterMode, ScanPlan};

/// Count image of one raster, indexed `[row, column]` with row 0 at `-Vy`
#[derive(Debug, Clone, PartialEq)]
pub struct ScanImage {
    pub data: Array2<f64>,
    /// `[x_min, x_max, y_min, y_max]` in volts
    pub extent: [f64; 4],
    pub mode: RasterMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub total: f64,
}

#[derive(Serialize)]
struct ImageDump<'a> {
    rows: usize,
    columns: usize,
    extent: [f64; 4],
    mode: RasterMode,
    stats: ImageStats,
    counts: Vec<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scan: Option<&'a ScanStats>,
}

impl ScanImage {
    pub fn empty(plan: &ScanPlan, mode: RasterMode) -> Self {
        Self {
            data: Array2::zeros((plan.y.pixels, plan.x.pixels)),
            extent: plan.extent_v(),
            mode,
        }
    }

    /// Arrange counts, given in visiting order, into an image in voltage order
    ///
    /// Square rasters record odd rows right to left, so those rows are
    /// reversed back here.
    pub fn from_counts(
        counts: &[i32],
        plan: &ScanPlan,
        mode: RasterMode,
    ) -> Result<Self, GalvoError> {
        let (rows, columns) = (plan.y.pixels, plan.x.pixels);
        if counts.len() != rows * columns {
            return Err(GalvoError::Protocol(format!(
                "expected {} counts for a {columns} x {rows} image, got {}",
                rows * columns,
                counts.len()
            )));
        }

        let data = Array2::from_shape_fn((rows, columns), |(r, c)| {
            let visited = if mode == RasterMode::Square && r % 2 == 1 {
                columns - 1 - c
            } else {
                c
            };
            counts[r * columns + visited] as f64
        });

        Ok(Self {
            data,
            extent: plan.extent_v(),
            mode,
        })
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn columns(&self) -> usize {
        self.data.ncols()
    }

    pub fn stats(&self) -> ImageStats {
        if self.data.is_empty() {
            return ImageStats {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                total: 0.0,
            };
        }
        let min = self.data.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let total = self.data.sum();
        ImageStats {
            min,
            max,
            mean: total / self.data.len() as f64,
            total,
        }
    }

    /// Write a 16-bit greyscale PNG scaled to the brightest pixel, +y up
    pub fn save_png<P: AsRef<Path>>(&self, path: P) -> Result<(), GalvoError> {
        let path = path.as_ref();
        let (width, height) = (self.columns() as u32, self.rows() as u32);
        if width == 0 || height == 0 {
            return Err(GalvoError::InvalidConfig("cannot save an empty image".to_string()));
        }

        let max = self.stats().max;
        let scale = if max > 0.0 { u16::MAX as f64 / max } else { 0.0 };
        let rows = self.rows();
        let buffer: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_fn(width, height, |x, y| {
            let value = self.data[[rows - 1 - y as usize, x as usize]];
            Luma([(value.max(0.0) * scale).round() as u16])
        });

        buffer.save(path).map_err(|e| GalvoError::Io {
            source: std::io::Error::other(e.to_string()),
            context: format!("Could not write image to {path:?}"),
        })?;
        info!("Saved {width} x {height} image to {path:?}");
        Ok(())
    }

    /// Write counts, extent and statistics as pretty JSON
    pub fn save_json<P: AsRef<Path>>(
        &self,
        path: P,
        scan: Option<&ScanStats>,
    ) -> Result<(), GalvoError> {
        let path = path.as_ref();
        let dump = ImageDump {
            rows: self.rows(),
            columns: self.columns(),
            extent: self.extent,
            mode: self.mode,
            stats: self.stats(),
            counts: self.data.rows().into_iter().map(|row| row.to_vec()).collect(),
            scan,
        };
        let json = serde_json::to_string_pretty(&dump)?;
        std::fs::write(path, json).map_err(|source| GalvoError::Io {
            source,
            context: format!("Could not write JSON to {path:?}"),
        })?;
        Ok(())
    }
}

/// Outcome of [`acquire`]
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub image: ScanImage,
    pub stats: ScanStats,
}

/// Run a raster on a worker thread while the counter bins one gate per pixel
///
/// `on_update` receives the partial image every `poll_interval` while the
/// scan runs and once more with the final counts. With a `timeout` the scan
/// is run as a bounded [`Job`]. The counter is freed before returning, also
/// when the scan fails.
pub fn acquire<D, C, F>(
    driver: RasterDriver<D>,
    counter: &mut C,
    gate: &GateConfig,
    poll_interval: Duration,
    timeout: Option<Duration>,
    mut on_update: F,
) -> Result<Acquisition, GalvoError>
where
    D: DaqInterface + 'static,
    C: CountingInstrument + ?Sized,
    F: FnMut(&ScanImage),
{
    let plan = *driver.plan();
    let mode = driver.config().mode;
    let pixels = plan.pixel_count();

    let delayed = counter.configure_gate(gate)?;
    debug!("Gate closes on delayed channel {delayed}");
    counter.start_counting(pixels)?;

    let mut driver = driver;
    let worker = thread::Builder::new()
        .name("raster".to_string())
        .spawn(move || match timeout {
            Some(timeout) => driver.run(timeout),
            None => driver.scan(),
        })
        .map_err(|e| GalvoError::Worker(format!("could not start raster thread: {e}")))?;

    let mut polled = Ok(());
    while !worker.is_finished() {
        polled = counter
            .counts()
            .and_then(|counts| ScanImage::from_counts(&counts, &plan, mode))
            .map(|image| on_update(&image));
        if polled.is_err() {
            break;
        }
        thread::sleep(poll_interval);
    }

    let scanned = worker
        .join()
        .map_err(|_| GalvoError::Worker("raster thread panicked".to_string()))
        .and_then(|result| result);

    let finished = polled.and_then(|_| {
        let counts = counter.counts()?;
        let complete = counter.is_complete()?;
        Ok((ScanImage::from_counts(&counts, &plan, mode)?, complete))
    });
    if let Err(e) = counter.free() {
        warn!("Failed to free counting instrument: {e}");
    }

    let stats = scanned?;
    let (image, complete) = finished?;
    on_update(&image);

    if !stats.cancelled && !complete {
        warn!(
            "Counter did not fill all {pixels} gates ({} pixels visited)",
            stats.pixels_visited
        );
    }
    Ok(Acquisition { image, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{SimulatedCounter, gaussian_spot};
    use crate::labjack::{DaqChannels, SimulatedDaq};
    use crate::planner::ScanConfig;
    use crate::types::{AxisRange, DacRange, VoltagePair};
    use crossbeam_channel::unbounded;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn plan(columns: usize, rows: usize) -> ScanPlan {
        ScanPlan {
            x: AxisRange {
                half_range_v: 0.2,
                pixels: columns,
            },
            y: AxisRange {
                half_range_v: 0.2,
                pixels: rows,
            },
            spacing: 1,
            step_v: 0.1,
        }
    }

    fn config(mode: RasterMode) -> ScanConfig {
        ScanConfig {
            integration_time_us: 5.0,
            settle_time_ms: 0,
            mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_square_counts_are_unflipped() {
        let counts = [1, 2, 3, 6, 5, 4];
        let image = ScanImage::from_counts(&counts, &plan(3, 2), RasterMode::Square).unwrap();
        assert_eq!(image.data.row(0).to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(image.data.row(1).to_vec(), vec![4.0, 5.0, 6.0]);

        let sawtooth = ScanImage::from_counts(&counts, &plan(3, 2), RasterMode::Sawtooth).unwrap();
        assert_eq!(sawtooth.data.row(1).to_vec(), vec![6.0, 5.0, 4.0]);
    }

    #[test]
    fn test_count_length_must_match_plan() {
        assert!(ScanImage::from_counts(&[1, 2, 3], &plan(2, 2), RasterMode::Sawtooth).is_err());
    }

    #[test]
    fn test_stats() {
        let image =
            ScanImage::from_counts(&[0, 2, 4, 6], &plan(2, 2), RasterMode::Sawtooth).unwrap();
        let stats = image.stats();
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 6.0);
        assert_eq!(stats.total, 12.0);
        assert_eq!(stats.mean, 3.0);
        assert_eq!(ScanImage::empty(&plan(0, 0), RasterMode::Square).stats().max, 0.0);
    }

    #[test]
    fn test_acquire_images_a_spot() {
        let (tx, rx) = unbounded();
        let daq = SimulatedDaq::new();
        let journal = daq.journal();
        let driver = RasterDriver::new(
            daq,
            DaqChannels::default(),
            DacRange::default(),
            config(RasterMode::Square),
            plan(4, 4),
        )
        .with_event_sender(tx);

        // Spot sits on the pixel at column 3, row 1
        let spot = gaussian_spot(VoltagePair::new(0.1, -0.1), 0.01, 1.0e9, 0.0);
        let mut counter = SimulatedCounter::new(rx, spot);
        let gate = GateConfig::for_integration_time(Duration::from_micros(5));

        let mut updates = 0;
        let result = acquire(
            driver,
            &mut counter,
            &gate,
            Duration::from_millis(1),
            None,
            |_| updates += 1,
        )
        .unwrap();

        assert!(updates >= 1);
        assert_eq!(result.stats.pixels_visited, 16);
        assert!(journal.closed());

        let image = result.image;
        let brightest = image
            .data
            .indexed_iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(index, _)| index)
            .unwrap();
        assert_eq!(brightest, (1, 3));
        assert_eq!(image.extent, [-0.2, 0.2, -0.2, 0.2]);
    }

    #[test]
    fn test_counter_missing_gates_is_warned_about() {
        crate::test_log::capture();
        let (_tx, rx) = unbounded();
        let driver = RasterDriver::new(
            SimulatedDaq::new(),
            DaqChannels::default(),
            DacRange::default(),
            config(RasterMode::Sawtooth),
            plan(2, 2),
        );
        let spot = gaussian_spot(VoltagePair::ORIGIN, 0.1, 1.0e6, 0.0);
        let mut counter = SimulatedCounter::new(rx, spot);
        let gate = GateConfig::for_integration_time(Duration::from_micros(5));

        let result =
            acquire(driver, &mut counter, &gate, Duration::from_millis(1), None, |_| {}).unwrap();

        assert_eq!(result.stats.pixels_visited, 4);
        assert_eq!(result.image.stats().total, 0.0);
        assert!(
            crate::test_log::warnings()
                .iter()
                .any(|w| w.contains("did not fill all 4 gates"))
        );
    }

    #[test]
    fn test_cancelled_acquisition_keeps_partial_image() {
        let (tx, rx) = unbounded();
        let driver = RasterDriver::new(
            SimulatedDaq::new(),
            DaqChannels::default(),
            DacRange::default(),
            config(RasterMode::Sawtooth),
            plan(3, 3),
        )
        .with_event_sender(tx)
        .with_cancel_flag(Arc::new(AtomicBool::new(true)));

        let mut counter = SimulatedCounter::new(rx, Box::new(|_, _| 1));
        let result = acquire(
            driver,
            &mut counter,
            &GateConfig::default(),
            Duration::from_millis(1),
            None,
            |_| {},
        )
        .unwrap();
        assert!(result.stats.cancelled);
        assert_eq!(result.image.stats().total, 0.0);
    }

    #[test]
    fn test_scan_failure_frees_counter() {
        let (tx, rx) = unbounded();
        let mut bad_plan = plan(2, 2);
        bad_plan.x.half_range_v = 50.0;
        let driver = RasterDriver::new(
            SimulatedDaq::new(),
            DaqChannels::default(),
            DacRange::default(),
            config(RasterMode::Sawtooth),
            bad_plan,
        )
        .with_event_sender(tx);

        let mut counter = SimulatedCounter::new(rx, Box::new(|_, _| 1));
        let result = acquire(
            driver,
            &mut counter,
            &GateConfig::default(),
            Duration::from_millis(1),
            None,
            |_| {},
        );
        assert!(matches!(result, Err(GalvoError::Limit { .. })));
        assert!(matches!(counter.counts(), Err(GalvoError::DeviceClosed)));
    }

    #[test]
    fn test_timeout_is_reported() {
        let (tx, rx) = unbounded();
        let daq = SimulatedDaq::new();
        let journal = daq.journal();
        let driver = RasterDriver::new(
            daq,
            DaqChannels::default(),
            DacRange::default(),
            config(RasterMode::Sawtooth),
            plan(2, 2),
        )
        .with_event_sender(tx);

        let mut counter = SimulatedCounter::new(rx, Box::new(|_, _| 1));
        let result = acquire(
            driver,
            &mut counter,
            &GateConfig::default(),
            Duration::from_millis(1),
            Some(Duration::ZERO),
            |_| {},
        );
        assert!(matches!(result, Err(GalvoError::Timeout)));
        assert!(journal.closed());
    }

    #[test]
    fn test_png_and_json_output() {
        let image =
            ScanImage::from_counts(&[0, 10, 20, 30], &plan(2, 2), RasterMode::Sawtooth).unwrap();
        let dir = std::env::temp_dir();
        let png = dir.join(format!("galvo-scan-{}-image.png", std::process::id()));
        let json = dir.join(format!("galvo-scan-{}-image.json", std::process::id()));

        image.save_png(&png).unwrap();
        let decoded = image::open(&png).unwrap().into_luma16();
        assert_eq!(decoded.dimensions(), (2, 2));
        // +y up: the last data row is the top of the picture
        assert_eq!(decoded.get_pixel(1, 0)[0], u16::MAX);
        assert_eq!(decoded.get_pixel(0, 1)[0], 0);

        image.save_json(&json, None).unwrap();
        let text = std::fs::read_to_string(&json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["rows"], 2);
        assert_eq!(value["counts"][1][1], 30.0);
        assert!(value.get("scan").is_none());

        std::fs::remove_file(&png).unwrap();
        std::fs::remove_file(&json).unwrap();
    }
}
