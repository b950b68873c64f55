use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};

use crate::error::GalvoError;
use crate::job::Job;
use crate::labjack::{DaqChannels, DaqInterface};
use crate::planner::ScanConfig;
use crate::timing;
use crate::types::{DacRange, RasterMode, ScanPlan, VoltagePair};

/// Dwell multiplier for the first pixel of each row when edge checking
pub const EDGE_CHECK_MULTIPLIER: u32 = 100;

/// Lifecycle of a raster scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RasterState {
    Idle,
    /// Moving to the first pixel and waiting for the mirrors to settle
    Homing,
    Scanning,
    /// Parking the mirrors at the origin
    Returning,
    /// Device released
    Closed,
}

/// Timestamped record of what the raster driver did, for the acquisition side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    Started {
        columns: usize,
        rows: usize,
        mode: RasterMode,
        integration_time_us: f64,
    },
    /// The sync line was high from `start_us` for `dwell_us` (both relative to scan start)
    Pixel {
        index: usize,
        row: usize,
        column: usize,
        position: VoltagePair,
        start_us: u64,
        dwell_us: u64,
    },
    Finished {
        pixels: usize,
        cancelled: bool,
    },
}

/// Summary of a finished scan
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanStats {
    pub pixels_visited: usize,
    pub rows_completed: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
    /// Worst amount a dwell ran past its target
    pub max_overrun: Duration,
}

/// Order in which `(row, column)` pixels are visited
///
/// Sawtooth rows all run left to right. Square rasters reverse every odd
/// row, so the beam never jumps back across the field.
pub fn raster_path(
    columns: usize,
    rows: usize,
    mode: RasterMode,
) -> impl Iterator<Item = (usize, usize)> {
    (0..rows).flat_map(move |row| {
        let reversed = mode == RasterMode::Square && row % 2 == 1;
        (0..columns).map(move |i| {
            let column = if reversed { columns - 1 - i } else { i };
            (row, column)
        })
    })
}

/// Drives the galvos through a planned raster while toggling the sync line
///
/// The driver takes ownership of the DAQ handle. Whatever way the scan ends
/// (completion, cancellation, timeout, device error) the mirrors are parked
/// at the origin and the handle is closed before `scan` returns.
pub struct RasterDriver<D: DaqInterface> {
    daq: Option<D>,
    channels: DaqChannels,
    dac: DacRange,
    config: ScanConfig,
    plan: ScanPlan,
    state: RasterState,
    position: VoltagePair,
    stats: ScanStats,
    event_senders: Vec<Sender<ScanEvent>>,
    cancel: Arc<AtomicBool>,
}

impl<D: DaqInterface> RasterDriver<D> {
    pub fn new(
        daq: D,
        channels: DaqChannels,
        dac: DacRange,
        config: ScanConfig,
        plan: ScanPlan,
    ) -> Self {
        Self {
            daq: Some(daq),
            channels,
            dac,
            config,
            plan,
            state: RasterState::Idle,
            position: VoltagePair::ORIGIN,
            stats: ScanStats::default(),
            event_senders: Vec::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish scan events to `sender`; may be called more than once
    pub fn with_event_sender(mut self, sender: Sender<ScanEvent>) -> Self {
        self.event_senders.push(sender);
        self
    }

    /// Share a cancellation flag, e.g. one set from a Ctrl+C handler
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn state(&self) -> RasterState {
        self.state
    }

    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Last voltages successfully written to the mirrors
    pub fn position(&self) -> VoltagePair {
        self.position
    }

    /// Run the whole scan with no time limit
    pub fn scan(&mut self) -> Result<ScanStats, GalvoError> {
        self.execute(None)
    }

    fn execute(&mut self, deadline: Option<Instant>) -> Result<ScanStats, GalvoError> {
        if self.state != RasterState::Idle {
            return Err(GalvoError::DeviceClosed);
        }

        info!(
            "Starting {} raster: {} x {} pixels, {} us dwell",
            self.config.mode,
            self.plan.x.pixels,
            self.plan.y.pixels,
            self.config.integration_time_us
        );

        let outcome = self
            .check_extent()
            .and_then(|_| self.home())
            .and_then(|_| self.sweep(deadline));
        let shutdown = self.park_and_close();

        self.emit(ScanEvent::Finished {
            pixels: self.stats.pixels_visited,
            cancelled: self.stats.cancelled,
        });

        match (outcome, shutdown) {
            (Ok(()), Ok(())) => {
                info!(
                    "Raster finished: {} pixels in {:.3} s",
                    self.stats.pixels_visited,
                    self.stats.elapsed.as_secs_f64()
                );
                Ok(self.stats.clone())
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(shutdown_error)) => {
                error!("Shutdown after failed scan also failed: {shutdown_error}");
                Err(e)
            }
        }
    }

    /// Refuse plans whose corners fall outside the DAC range
    fn check_extent(&self) -> Result<(), GalvoError> {
        let plan = &self.plan;
        if plan.pixel_count() == 0 {
            return Ok(());
        }
        self.dac.check(plan.pixel_voltage(0, 0))?;
        self.dac
            .check(plan.pixel_voltage(plan.y.pixels - 1, plan.x.pixels - 1))
    }

    fn home(&mut self) -> Result<(), GalvoError> {
        self.state = RasterState::Homing;

        let daq = self.daq.as_mut().ok_or(GalvoError::DeviceClosed)?;
        self.channels.sync_off(daq)?;

        let first = raster_path(self.plan.x.pixels, self.plan.y.pixels, self.config.mode).next();
        if let Some((row, column)) = first {
            self.commit(self.plan.pixel_voltage(row, column))?;
            debug!("Homed to {}, settling for {:?}", self.position, self.config.settle_time());
            std::thread::sleep(self.config.settle_time());
        }
        Ok(())
    }

    fn sweep(&mut self, deadline: Option<Instant>) -> Result<(), GalvoError> {
        self.state = RasterState::Scanning;

        let columns = self.plan.x.pixels;
        let rows = self.plan.y.pixels;
        let dwell = self.config.integration_time();
        let edge_dwell = dwell * EDGE_CHECK_MULTIPLIER;
        let origin = Instant::now();

        self.emit(ScanEvent::Started {
            columns,
            rows,
            mode: self.config.mode,
            integration_time_us: self.config.integration_time_us,
        });

        for (index, (row, column)) in raster_path(columns, rows, self.config.mode).enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                warn!("Raster cancelled at pixel {index} of {}", columns * rows);
                self.stats.cancelled = true;
                break;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("Raster timed out at pixel {index} of {}", columns * rows);
                self.stats.elapsed = origin.elapsed();
                return Err(GalvoError::Timeout);
            }

            let first_in_row = index % columns == 0;
            let target = if first_in_row && self.config.edge_check {
                edge_dwell
            } else {
                dwell
            };

            self.commit(self.plan.pixel_voltage(row, column))?;

            let daq = self.daq.as_mut().ok_or(GalvoError::DeviceClosed)?;
            self.channels.sync_on(daq)?;
            let start = Instant::now();
            let actual = timing::spin_wait(target);
            self.channels.sync_off(daq)?;

            self.stats.pixels_visited += 1;
            self.stats.max_overrun = self.stats.max_overrun.max(actual.saturating_sub(target));
            if index % columns == columns - 1 {
                self.stats.rows_completed += 1;
            }

            self.emit(ScanEvent::Pixel {
                index,
                row,
                column,
                position: self.position,
                start_us: start.duration_since(origin).as_micros() as u64,
                dwell_us: actual.as_micros() as u64,
            });
        }

        self.stats.elapsed = origin.elapsed();
        Ok(())
    }

    fn park_and_close(&mut self) -> Result<(), GalvoError> {
        self.state = RasterState::Returning;

        let Some(mut daq) = self.daq.take() else {
            self.state = RasterState::Closed;
            return Err(GalvoError::DeviceClosed);
        };

        let park = park_position(&self.dac);
        let parked = self
            .channels
            .sync_off(&mut daq)
            .and_then(|_| self.channels.write_pair(&mut daq, park));
        if parked.is_ok() {
            self.position = park;
        }

        let closed = daq.close();
        self.state = RasterState::Closed;

        match (&parked, &closed) {
            (Err(park_error), Err(close_error)) => {
                error!(
                    "Failed to park mirrors ({park_error}) and to release the DAQ ({close_error})"
                );
            }
            (Err(park_error), Ok(())) => error!("Failed to park mirrors: {park_error}"),
            (Ok(()), Err(close_error)) => error!("Failed to release the DAQ: {close_error}"),
            (Ok(()), Ok(())) => debug!("Mirrors parked at {park} and DAQ released"),
        }

        parked.and(closed)
    }

    /// Write both axes after checking them against the DAC range
    fn commit(&mut self, pair: VoltagePair) -> Result<(), GalvoError> {
        self.dac.check(pair)?;
        let daq = self.daq.as_mut().ok_or(GalvoError::DeviceClosed)?;
        self.channels.write_pair(daq, pair)?;
        self.position = pair;
        Ok(())
    }

    fn emit(&mut self, event: ScanEvent) {
        self.event_senders
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

impl<D: DaqInterface> Job for RasterDriver<D> {
    type Output = ScanStats;

    fn run(&mut self, timeout: Duration) -> Result<ScanStats, GalvoError> {
        self.execute(Some(Instant::now() + timeout))
    }
}

/// Rest position for `dac`, logging when the origin is out of reach
fn park_position(dac: &DacRange) -> VoltagePair {
    let park = dac.park_position();
    if park != VoltagePair::ORIGIN {
        warn!(
            "Origin is outside the DAC range [{}, {}] V, parking at {park} instead",
            dac.min, dac.max
        );
    }
    park
}

/// Manual recovery after a scan died without parking: move both axes to the
/// park position, drop the sync line and release the device.
pub fn reset<D: DaqInterface + ?Sized>(
    daq: &mut D,
    channels: &DaqChannels,
    dac: &DacRange,
) -> Result<(), GalvoError> {
    let park = park_position(dac);
    channels.sync_off(daq)?;
    channels.write_pair(daq, park)?;
    daq.close()?;
    info!("Galvos reset to {park} and DAQ released");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labjack::{DaqJournal, SimulatedDaq};
    use crate::types::AxisRange;
    use crossbeam_channel::unbounded;
    use std::thread;

    fn small_plan(columns: usize, rows: usize) -> ScanPlan {
        ScanPlan {
            x: AxisRange {
                half_range_v: 1.0,
                pixels: columns,
            },
            y: AxisRange {
                half_range_v: 0.5,
                pixels: rows,
            },
            spacing: 1,
            step_v: 0.25,
        }
    }

    fn fast_config(mode: RasterMode) -> ScanConfig {
        ScanConfig {
            integration_time_us: 1.0,
            settle_time_ms: 0,
            mode,
            ..Default::default()
        }
    }

    fn sim_driver(
        mode: RasterMode,
        columns: usize,
        rows: usize,
    ) -> (RasterDriver<SimulatedDaq>, DaqJournal) {
        let daq = SimulatedDaq::new();
        let journal = daq.journal();
        let driver = RasterDriver::new(
            daq,
            DaqChannels::default(),
            DacRange::default(),
            fast_config(mode),
            small_plan(columns, rows),
        );
        (driver, journal)
    }

    #[test]
    fn test_raster_path_orders() {
        let sawtooth: Vec<_> = raster_path(3, 2, RasterMode::Sawtooth).collect();
        assert_eq!(sawtooth, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);

        let square: Vec<_> = raster_path(3, 2, RasterMode::Square).collect();
        assert_eq!(square, vec![(0, 0), (0, 1), (0, 2), (1, 2), (1, 1), (1, 0)]);

        assert_eq!(raster_path(0, 5, RasterMode::Square).count(), 0);
    }

    #[test]
    fn test_sawtooth_scan_visits_every_pixel() {
        let (mut driver, journal) = sim_driver(RasterMode::Sawtooth, 3, 2);
        let stats = driver.scan().unwrap();

        assert_eq!(stats.pixels_visited, 6);
        assert_eq!(stats.rows_completed, 2);
        assert!(!stats.cancelled);
        assert_eq!(driver.state(), RasterState::Closed);

        // homing write, six pixels, park
        let pairs = journal.pairs();
        assert_eq!(pairs.len(), 8);
        let pixels = &pairs[1..7];
        assert_eq!(
            pixels,
            &[
                (-1.0, -0.5),
                (-0.75, -0.5),
                (-0.5, -0.5),
                (-1.0, -0.25),
                (-0.75, -0.25),
                (-0.5, -0.25),
            ]
        );
        assert_eq!(pairs[7], (0.0, 0.0));
        assert!(journal.closed());
    }

    #[test]
    fn test_square_scan_reverses_odd_rows() {
        let (mut driver, journal) = sim_driver(RasterMode::Square, 3, 2);
        driver.scan().unwrap();

        let pairs = journal.pairs();
        let row0: Vec<f64> = pairs[1..4].iter().map(|p| p.0).collect();
        let row1: Vec<f64> = pairs[4..7].iter().map(|p| p.0).collect();
        let mut reversed = row0.clone();
        reversed.reverse();
        assert_eq!(row1, reversed);
    }

    #[test]
    fn test_sync_line_toggles_around_each_pixel() {
        let (mut driver, journal) = sim_driver(RasterMode::Sawtooth, 3, 2);
        driver.scan().unwrap();

        let sync = journal.writes_to("FIO2");
        // low before homing, high/low per pixel, low when parking
        assert_eq!(sync.len(), 1 + 2 * 6 + 1);
        assert_eq!(&sync[1..3], &[1.0, 0.0]);
        assert_eq!(sync.iter().filter(|v| **v == 1.0).count(), 6);
        assert_eq!(*sync.last().unwrap(), 0.0);
    }

    #[test]
    fn test_events_describe_the_scan() {
        let (tx, rx) = unbounded();
        let (driver, _) = sim_driver(RasterMode::Square, 3, 2);
        let mut driver = driver.with_event_sender(tx);
        driver.scan().unwrap();
        drop(driver);

        let events: Vec<ScanEvent> = rx.iter().collect();
        assert_eq!(events.len(), 8);
        assert!(matches!(events[0], ScanEvent::Started { columns: 3, rows: 2, .. }));
        match &events[4] {
            ScanEvent::Pixel { index, row, column, .. } => {
                assert_eq!((*index, *row, *column), (3, 1, 2));
            }
            other => panic!("expected pixel event, got {other:?}"),
        }
        assert_eq!(
            events[7],
            ScanEvent::Finished {
                pixels: 6,
                cancelled: false
            }
        );
    }

    #[test]
    fn test_edge_check_extends_first_pixel_of_each_row() {
        let (tx, rx) = unbounded();
        let daq = SimulatedDaq::new();
        let config = ScanConfig {
            integration_time_us: 10.0,
            edge_check: true,
            ..fast_config(RasterMode::Sawtooth)
        };
        let mut driver = RasterDriver::new(
            daq,
            DaqChannels::default(),
            DacRange::default(),
            config,
            small_plan(3, 2),
        )
        .with_event_sender(tx);
        driver.scan().unwrap();
        drop(driver);

        for event in rx.iter() {
            if let ScanEvent::Pixel { column, dwell_us, .. } = event {
                if column == 0 {
                    assert!(dwell_us >= 1000, "edge dwell was {dwell_us} us");
                } else {
                    assert!(dwell_us >= 10);
                }
            }
        }
    }

    #[test]
    fn test_cancel_before_start_still_parks_and_closes() {
        let (driver, journal) = sim_driver(RasterMode::Sawtooth, 3, 2);
        let flag = Arc::new(AtomicBool::new(true));
        let mut driver = driver.with_cancel_flag(flag);

        let stats = driver.scan().unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.pixels_visited, 0);
        assert_eq!(journal.pairs().last(), Some(&(0.0, 0.0)));
        assert!(journal.closed());
        assert_eq!(driver.state(), RasterState::Closed);
    }

    #[test]
    fn test_cancel_mid_scan_from_another_thread() {
        let (tx, rx) = unbounded();
        let daq = SimulatedDaq::new();
        let journal = daq.journal();
        let config = ScanConfig {
            integration_time_us: 200.0,
            ..fast_config(RasterMode::Square)
        };
        let driver = RasterDriver::new(
            daq,
            DaqChannels::default(),
            DacRange::default(),
            config,
            small_plan(20, 20),
        );
        let flag = driver.cancel_flag();
        let mut driver = driver.with_event_sender(tx);

        let worker = thread::spawn(move || driver.scan());

        let mut pixels_seen = 0;
        for event in rx.iter() {
            if matches!(event, ScanEvent::Pixel { .. }) {
                pixels_seen += 1;
                if pixels_seen == 5 {
                    flag.store(true, Ordering::SeqCst);
                }
            }
        }

        let stats = worker.join().unwrap().unwrap();
        assert!(stats.cancelled);
        assert!(stats.pixels_visited >= 5);
        assert!(stats.pixels_visited < 400);
        assert_eq!(journal.pairs().last(), Some(&(0.0, 0.0)));
        assert!(journal.closed());
    }

    #[test]
    fn test_timeout_parks_and_reports() {
        let (mut driver, journal) = sim_driver(RasterMode::Sawtooth, 3, 2);
        let result = Job::run(&mut driver, Duration::ZERO);

        assert!(matches!(result, Err(GalvoError::Timeout)));
        assert_eq!(journal.pairs().last(), Some(&(0.0, 0.0)));
        assert!(journal.closed());
    }

    #[test]
    fn test_plan_outside_dac_range_is_refused() {
        let daq = SimulatedDaq::new();
        let journal = daq.journal();
        let mut plan = small_plan(3, 2);
        plan.x.half_range_v = 12.0;
        let mut driver = RasterDriver::new(
            daq,
            DaqChannels::default(),
            DacRange::default(),
            fast_config(RasterMode::Sawtooth),
            plan,
        );

        assert!(matches!(driver.scan(), Err(GalvoError::Limit { .. })));
        // only the park write reached the device
        assert_eq!(journal.pairs(), vec![(0.0, 0.0)]);
        assert!(journal.closed());
    }

    #[test]
    fn test_release_failure_is_surfaced() {
        let daq = SimulatedDaq::new().failing_close();
        let mut driver = RasterDriver::new(
            daq,
            DaqChannels::default(),
            DacRange::default(),
            fast_config(RasterMode::Sawtooth),
            small_plan(2, 2),
        );
        assert!(matches!(driver.scan(), Err(GalvoError::Release(_))));
        assert_eq!(driver.state(), RasterState::Closed);
    }

    #[test]
    fn test_driver_runs_only_once() {
        let (mut driver, _) = sim_driver(RasterMode::Sawtooth, 2, 2);
        driver.scan().unwrap();
        assert!(matches!(driver.scan(), Err(GalvoError::DeviceClosed)));
    }

    #[test]
    fn test_reset_parks_and_closes() {
        let mut daq = SimulatedDaq::new();
        daq.write_names(&[("TDAC0", 3.0), ("TDAC1", -2.0)]).unwrap();
        let journal = daq.journal();

        reset(&mut daq, &DaqChannels::default(), &DacRange::default()).unwrap();

        assert_eq!(journal.pairs().last(), Some(&(0.0, 0.0)));
        assert_eq!(journal.writes_to("FIO2"), vec![0.0]);
        assert!(!daq.is_open());
    }

    #[test]
    fn test_park_respects_a_dac_without_negative_range() {
        let dac = DacRange::t7_builtin();
        let daq = SimulatedDaq::new();
        let journal = daq.journal();
        let mut driver = RasterDriver::new(
            daq,
            DaqChannels::default(),
            dac,
            fast_config(RasterMode::Sawtooth),
            small_plan(0, 0),
        );

        driver.scan().unwrap();

        let pairs = journal.pairs();
        assert_eq!(pairs.len(), 1);
        for (x, y) in pairs {
            assert!(dac.check(VoltagePair::new(x, y)).is_ok());
        }
        assert_eq!(driver.position(), dac.park_position());
        assert!(journal.closed());
    }

    #[test]
    fn test_reset_respects_a_dac_without_negative_range() {
        let dac = DacRange::t7_builtin();
        let mut daq = SimulatedDaq::new();
        let journal = daq.journal();

        reset(&mut daq, &DaqChannels::default(), &dac).unwrap();

        let (x, y) = journal.pairs()[0];
        assert!(dac.check(VoltagePair::new(x, y)).is_ok());
        assert!(!daq.is_open());
    }
}
