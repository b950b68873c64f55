use crossbeam_channel::Receiver;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::GalvoError;
use crate::raster::ScanEvent;
use crate::types::VoltagePair;

/// How the photon counter is gated by the DAQ sync line
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Channel carrying detector clicks
    pub click_channel: i32,
    /// Channel wired to the DAQ sync output
    pub sync_channel: i32,
    /// Delay of the derived channel, in picoseconds
    pub delay_ps: u64,
    /// Input threshold on the sync channel
    pub trigger_level_v: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            click_channel: 1,
            sync_channel: 5,
            delay_ps: 100_000_000,
            trigger_level_v: 0.169,
        }
    }
}

impl GateConfig {
    /// Gate whose delayed channel closes one integration time after the sync edge
    pub fn for_integration_time(integration: Duration) -> Self {
        Self {
            delay_ps: integration.as_nanos() as u64 * 1000,
            ..Self::default()
        }
    }
}

/// Photon counter that bins clicks between rising and falling sync edges
pub trait CountingInstrument: Send {
    /// Create the delayed channel for `gate` and return its channel number
    fn configure_gate(&mut self, gate: &GateConfig) -> Result<i32, GalvoError>;

    /// Arm a measurement of `bins` consecutive gates
    fn start_counting(&mut self, bins: usize) -> Result<(), GalvoError>;

    /// Counts so far, one per bin, in the order the gates arrived
    fn counts(&mut self) -> Result<Vec<i32>, GalvoError>;

    fn is_complete(&mut self) -> Result<bool, GalvoError>;

    /// Release the instrument
    fn free(&mut self) -> Result<(), GalvoError>;
}

/// Count model used by [`SimulatedCounter`]: position and dwell to clicks
pub type SampleFn = Box<dyn Fn(VoltagePair, Duration) -> i32 + Send>;

/// Gaussian emitter at `center` with the given peak rate and width, over a
/// flat background rate. Rates are in counts per second.
pub fn gaussian_spot(
    center: VoltagePair,
    sigma_v: f64,
    peak_rate: f64,
    background_rate: f64,
) -> SampleFn {
    Box::new(move |position: VoltagePair, dwell: Duration| {
        let dx = position.x - center.x;
        let dy = position.y - center.y;
        let r2 = dx * dx + dy * dy;
        let rate = peak_rate * (-r2 / (2.0 * sigma_v * sigma_v)).exp() + background_rate;
        (rate * dwell.as_secs_f64()).round() as i32
    })
}

/// Counter driven by the raster's event stream instead of hardware
///
/// Every `Pixel` event fills the next bin with the model's count for that
/// position and measured dwell.
pub struct SimulatedCounter {
    events: Receiver<ScanEvent>,
    sample: SampleFn,
    gate: Option<GateConfig>,
    bins: Vec<i32>,
    filled: usize,
    armed: bool,
    freed: bool,
}

impl SimulatedCounter {
    pub fn new(events: Receiver<ScanEvent>, sample: SampleFn) -> Self {
        Self {
            events,
            sample,
            gate: None,
            bins: Vec::new(),
            filled: 0,
            armed: false,
            freed: false,
        }
    }

    pub fn gate(&self) -> Option<&GateConfig> {
        self.gate.as_ref()
    }

    /// Bins filled so far
    pub fn filled(&self) -> usize {
        self.filled
    }

    fn ensure_usable(&self) -> Result<(), GalvoError> {
        if self.freed {
            Err(GalvoError::DeviceClosed)
        } else {
            Ok(())
        }
    }

    fn drain(&mut self) {
        if !self.armed {
            return;
        }
        for event in self.events.try_iter() {
            if let ScanEvent::Pixel {
                position, dwell_us, ..
            } = event
            {
                if self.filled < self.bins.len() {
                    let dwell = Duration::from_micros(dwell_us);
                    self.bins[self.filled] = (self.sample)(position, dwell);
                    self.filled += 1;
                }
            }
        }
    }
}

impl CountingInstrument for SimulatedCounter {
    fn configure_gate(&mut self, gate: &GateConfig) -> Result<i32, GalvoError> {
        self.ensure_usable()?;
        if gate.click_channel == gate.sync_channel {
            return Err(GalvoError::InvalidConfig(format!(
                "click and sync share channel {}",
                gate.click_channel
            )));
        }
        self.gate = Some(*gate);
        debug!(
            "Delayed channel on {} with {} ps delay, trigger at {} V",
            gate.sync_channel, gate.delay_ps, gate.trigger_level_v
        );
        // Virtual channels are numbered above the physical inputs
        Ok(gate.sync_channel + 100)
    }

    fn start_counting(&mut self, bins: usize) -> Result<(), GalvoError> {
        self.ensure_usable()?;
        if self.gate.is_none() {
            return Err(GalvoError::InvalidConfig(
                "gate must be configured before counting".to_string(),
            ));
        }
        self.bins = vec![0; bins];
        self.filled = 0;
        self.armed = true;
        info!("Counting {bins} gates");
        Ok(())
    }

    fn counts(&mut self) -> Result<Vec<i32>, GalvoError> {
        self.ensure_usable()?;
        self.drain();
        Ok(self.bins.clone())
    }

    fn is_complete(&mut self) -> Result<bool, GalvoError> {
        self.ensure_usable()?;
        self.drain();
        Ok(self.armed && self.filled == self.bins.len())
    }

    fn free(&mut self) -> Result<(), GalvoError> {
        self.ensure_usable()?;
        self.freed = true;
        self.armed = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crossbeam_channel::unbounded;

    fn pixel(index: usize, x: f64) -> ScanEvent {
        ScanEvent::Pixel {
            index,
            row: 0,
            column: index,
            position: VoltagePair::new(x, 0.0),
            start_us: 0,
            dwell_us: 10_000,
        }
    }

    #[test]
    fn test_gate_delay_matches_integration_time() {
        let gate = GateConfig::for_integration_time(Duration::from_millis(10));
        assert_eq!(gate.delay_ps, 10_000_000_000);
        assert_relative_eq!(gate.trigger_level_v, 0.169);
    }

    #[test]
    fn test_gaussian_spot_peaks_at_center() {
        let spot = gaussian_spot(VoltagePair::new(0.1, 0.0), 0.05, 1.0e5, 100.0);
        let dwell = Duration::from_millis(10);
        let peak = spot(VoltagePair::new(0.1, 0.0), dwell);
        let off = spot(VoltagePair::new(0.5, 0.5), dwell);
        assert_eq!(peak, 1001);
        assert_eq!(off, 1);
    }

    #[test]
    fn test_bins_fill_in_arrival_order() {
        let (tx, rx) = unbounded();
        let mut counter = SimulatedCounter::new(rx, Box::new(|p, _| (p.x * 10.0) as i32));
        counter.configure_gate(&GateConfig::default()).unwrap();
        counter.start_counting(3).unwrap();

        tx.send(pixel(0, 0.3)).unwrap();
        tx.send(pixel(1, 0.1)).unwrap();
        assert_eq!(counter.counts().unwrap(), vec![3, 1, 0]);
        assert!(!counter.is_complete().unwrap());

        tx.send(ScanEvent::Finished {
            pixels: 3,
            cancelled: false,
        })
        .unwrap();
        tx.send(pixel(2, 0.2)).unwrap();
        assert!(counter.is_complete().unwrap());
        assert_eq!(counter.counts().unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn test_extra_gates_are_ignored() {
        let (tx, rx) = unbounded();
        let mut counter = SimulatedCounter::new(rx, Box::new(|_, _| 1));
        counter.configure_gate(&GateConfig::default()).unwrap();
        counter.start_counting(1).unwrap();
        tx.send(pixel(0, 0.0)).unwrap();
        tx.send(pixel(1, 0.0)).unwrap();
        assert_eq!(counter.counts().unwrap(), vec![1]);
        assert_eq!(counter.filled(), 1);
    }

    #[test]
    fn test_counting_requires_gate() {
        let (_tx, rx) = unbounded();
        let mut counter = SimulatedCounter::new(rx, Box::new(|_, _| 0));
        assert!(matches!(
            counter.start_counting(4),
            Err(GalvoError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_freed_counter_refuses_use() {
        let (_tx, rx) = unbounded();
        let mut counter = SimulatedCounter::new(rx, Box::new(|_, _| 0));
        counter.free().unwrap();
        assert!(matches!(counter.counts(), Err(GalvoError::DeviceClosed)));
    }
}
