use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::GalvoError;
use crate::optics::OpticalModel;
use crate::timing;
use crate::types::{AxisRange, DacRange, RasterMode, ScanPlan};

/// Requested scan, as entered by the user or loaded from config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Field of view along x in micrometres
    pub width_um: f64,
    /// Field of view along y in micrometres
    pub height_um: f64,
    /// Pixel pitch as a multiple of the DAC quantum
    pub spacing: u32,
    /// Dwell per pixel in microseconds
    pub integration_time_us: f64,
    pub mode: RasterMode,
    /// Hold the first pixel of every row 100x longer, to check that rows line
    /// up in the image
    #[serde(default)]
    pub edge_check: bool,
    /// Time given to the mirrors to reach the start of the scan
    pub settle_time_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            width_um: 50.0,
            height_um: 50.0,
            spacing: 10,
            integration_time_us: 100.0,
            mode: RasterMode::Sawtooth,
            edge_check: false,
            settle_time_ms: 2000,
        }
    }
}

impl ScanConfig {
    pub fn integration_time(&self) -> Duration {
        timing::micros(self.integration_time_us)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_time_ms)
    }

    pub fn validate(&self) -> Result<(), GalvoError> {
        if !self.integration_time_us.is_finite() || self.integration_time_us < 0.0 {
            return Err(GalvoError::InvalidConfig(format!(
                "integration time must be a non-negative number of microseconds, got {}",
                self.integration_time_us
            )));
        }
        Ok(())
    }
}

/// Turns a field of view into voltage ranges and pixel counts
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanPlanner {
    optics: OpticalModel,
    dac: DacRange,
}

impl ScanPlanner {
    pub fn new(optics: OpticalModel, dac: DacRange) -> Self {
        Self { optics, dac }
    }

    pub fn optics(&self) -> &OpticalModel {
        &self.optics
    }

    pub fn dac(&self) -> &DacRange {
        &self.dac
    }

    /// Plan a `width_um` x `height_um` scan stepping `spacing` DAC quanta per pixel.
    ///
    /// A spacing of 0 would divide by zero; it is replaced by 1 and a warning
    /// is logged.
    pub fn plan(
        &self,
        width_um: f64,
        height_um: f64,
        spacing: u32,
    ) -> Result<ScanPlan, GalvoError> {
        let spacing = if spacing == 0 {
            warn!("Scan spacing of 0 would divide by zero, using 1 instead");
            1
        } else {
            spacing
        };

        let step_v = self.dac.quantum() * spacing as f64;
        let x = self.axis_range(width_um, step_v)?;
        let y = self.axis_range(height_um, step_v)?;

        debug!(
            "Planned {width_um} x {height_um} um scan: x ±{:.6} V ({} px), \
             y ±{:.6} V ({} px), step {:.6} V",
            x.half_range_v, x.pixels, y.half_range_v, y.pixels, step_v
        );

        Ok(ScanPlan {
            x,
            y,
            spacing,
            step_v,
        })
    }

    /// Plan the scan described by `config`
    pub fn plan_config(&self, config: &ScanConfig) -> Result<ScanPlan, GalvoError> {
        self.plan(config.width_um, config.height_um, config.spacing)
    }

    fn axis_range(&self, field_um: f64, step_v: f64) -> Result<AxisRange, GalvoError> {
        if !field_um.is_finite() || field_um < 0.0 {
            return Err(GalvoError::Domain(format!(
                "field size {field_um} um must be a non-negative distance"
            )));
        }
        let half_range_v = self.optics.distance_to_voltage(field_um / 2.0)?;
        let pixels = (2.0 * half_range_v / step_v).floor() as usize;
        Ok(AxisRange {
            half_range_v,
            pixels,
        })
    }
}
