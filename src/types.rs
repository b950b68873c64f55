use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::GalvoError;

/// Mirror axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
        }
    }
}

/// Direction of a single jog step, as seen on the arrow keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogDirection {
    Left,
    Right,
    Up,
    Down,
}

impl JogDirection {
    /// Axis moved and sign of the voltage change
    pub fn axis_and_sign(self) -> (Axis, f64) {
        match self {
            JogDirection::Left => (Axis::X, -1.0),
            JogDirection::Right => (Axis::X, 1.0),
            JogDirection::Up => (Axis::Y, 1.0),
            JogDirection::Down => (Axis::Y, -1.0),
        }
    }
}

/// Commanded voltages of both mirrors.
///
/// Always written to the DAQ as a pair so the two axes never disagree
/// about where the beam is supposed to be.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VoltagePair {
    pub x: f64,
    pub y: f64,
}

impl VoltagePair {
    pub const ORIGIN: VoltagePair = VoltagePair { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
        }
    }

    pub fn with(mut self, axis: Axis, value: f64) -> Self {
        match axis {
            Axis::X => self.x = value,
            Axis::Y => self.y = value,
        }
        self
    }
}

impl fmt::Display for VoltagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}) V", self.x, self.y)
    }
}

/// Output range and resolution of the DAC driving the mirrors
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DacRange {
    pub min: f64,
    pub max: f64,
    pub bits: u32,
}

impl Default for DacRange {
    /// LJTick-DAC: ±10 V at 14 bits
    fn default() -> Self {
        Self {
            min: -10.0,
            max: 10.0,
            bits: 14,
        }
    }
}

impl DacRange {
    /// The T7's own DAC0/DAC1 outputs, used when no LJTick-DAC is fitted
    pub fn t7_builtin() -> Self {
        Self {
            min: 0.0,
            max: 5.0,
            bits: 12,
        }
    }

    /// Smallest voltage step the DAC can resolve
    pub fn quantum(&self) -> f64 {
        (self.max - self.min) / ((1u64 << self.bits) - 1) as f64
    }

    /// Strictly inside the range; the rails themselves are not usable
    pub fn contains(&self, value: f64) -> bool {
        value > self.min && value < self.max
    }

    /// Check that both axes can be committed, reporting the first offender
    pub fn check(&self, pair: VoltagePair) -> Result<(), GalvoError> {
        for axis in [Axis::X, Axis::Y] {
            let value = pair.get(axis);
            if !self.contains(value) {
                let bound = if value >= self.max { self.max } else { self.min };
                return Err(GalvoError::Limit { axis, value, bound });
            }
        }
        Ok(())
    }

    /// Closest committable voltage to `value`, one quantum in from a rail
    pub fn nearest_inside(&self, value: f64) -> f64 {
        let quantum = self.quantum();
        value.clamp(self.min + quantum, self.max - quantum)
    }

    /// Where the mirrors rest between scans: the origin when the DAC can
    /// reach it, otherwise the nearest legal voltage on each axis
    pub fn park_position(&self) -> VoltagePair {
        let origin = VoltagePair::ORIGIN;
        if self.check(origin).is_ok() {
            return origin;
        }
        VoltagePair {
            x: self.nearest_inside(origin.x),
            y: self.nearest_inside(origin.y),
        }
    }

    pub fn validate(&self) -> Result<(), GalvoError> {
        if !(self.min < self.max) {
            return Err(GalvoError::InvalidConfig(format!(
                "DAC range [{}, {}] is empty",
                self.min, self.max
            )));
        }
        if self.bits == 0 || self.bits > 32 {
            return Err(GalvoError::InvalidConfig(format!(
                "DAC resolution of {} bits is not supported",
                self.bits
            )));
        }
        Ok(())
    }
}

/// Path shape of a raster scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterMode {
    /// Every row left to right; the flyback is not imaged
    #[default]
    Sawtooth,
    /// Alternate rows run right to left (serpentine)
    Square,
}

impl fmt::Display for RasterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterMode::Sawtooth => write!(f, "sawtooth"),
            RasterMode::Square => write!(f, "square"),
        }
    }
}

/// Voltage extent and pixel count of one scan axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// The axis sweeps from `-half_range_v` upward
    pub half_range_v: f64,
    pub pixels: usize,
}

impl AxisRange {
    pub fn span_v(&self) -> f64 {
        2.0 * self.half_range_v
    }
}

/// Result of planning a scan: per-axis ranges and the voltage step between pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    pub x: AxisRange,
    pub y: AxisRange,
    pub spacing: u32,
    pub step_v: f64,
}

impl ScanPlan {
    pub fn pixel_count(&self) -> usize {
        self.x.pixels * self.y.pixels
    }

    pub fn column_voltage(&self, column: usize) -> f64 {
        column as f64 * self.step_v - self.x.half_range_v
    }

    pub fn row_voltage(&self, row: usize) -> f64 {
        row as f64 * self.step_v - self.y.half_range_v
    }

    pub fn pixel_voltage(&self, row: usize, column: usize) -> VoltagePair {
        VoltagePair::new(self.column_voltage(column), self.row_voltage(row))
    }

    /// Image extent in volts as `[x_min, x_max, y_min, y_max]`
    pub fn extent_v(&self) -> [f64; 4] {
        [
            -self.x.half_range_v,
            self.x.half_range_v,
            -self.y.half_range_v,
            self.y.half_range_v,
        ]
    }
}

/// Named mirror positions kept for the lifetime of a session
#[derive(Debug, Clone, Default)]
pub struct SavedPositions {
    positions: BTreeMap<String, VoltagePair>,
}

impl SavedPositions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `pair` under `name`, replacing any earlier entry
    pub fn save(&mut self, name: &str, pair: VoltagePair) -> Option<VoltagePair> {
        self.positions.insert(name.to_string(), pair)
    }

    pub fn load(&self, name: &str) -> Result<VoltagePair, GalvoError> {
        self.positions
            .get(name)
            .copied()
            .ok_or_else(|| GalvoError::Lookup(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VoltagePair)> {
        self.positions.iter().map(|(name, pair)| (name.as_str(), pair))
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
