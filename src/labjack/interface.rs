use serde::{Deserialize, Serialize};

use crate::error::GalvoError;
use crate::types::VoltagePair;

/// Register-level DAQ interface used by the raster driver and the jog loop
///
/// Channels are addressed by their device name (`"TDAC0"`, `"FIO2"`, ...).
/// A value of this type is the device handle: it is owned by exactly one
/// controller at a time and released with [`DaqInterface::close`].
///
/// Implementations exist for a LabJack T7 reached over Modbus TCP and for an
/// in-memory simulator used in tests and dry runs.
pub trait DaqInterface: Send {
    /// Write a single named register
    fn write_name(&mut self, channel: &str, value: f64) -> Result<(), GalvoError>;

    /// Write several registers in one transaction where the device allows it
    ///
    /// The default implementation falls back to sequential writes.
    fn write_names(&mut self, writes: &[(&str, f64)]) -> Result<(), GalvoError> {
        for (channel, value) in writes {
            self.write_name(channel, *value)?;
        }
        Ok(())
    }

    /// Read a single named register
    fn read_name(&mut self, channel: &str) -> Result<f64, GalvoError>;

    /// Release the device; further calls fail with `DeviceClosed`
    fn close(&mut self) -> Result<(), GalvoError>;

    fn is_open(&self) -> bool;
}

impl<T: DaqInterface + ?Sized> DaqInterface for Box<T> {
    fn write_name(&mut self, channel: &str, value: f64) -> Result<(), GalvoError> {
        (**self).write_name(channel, value)
    }

    fn write_names(&mut self, writes: &[(&str, f64)]) -> Result<(), GalvoError> {
        (**self).write_names(writes)
    }

    fn read_name(&mut self, channel: &str) -> Result<f64, GalvoError> {
        (**self).read_name(channel)
    }

    fn close(&mut self) -> Result<(), GalvoError> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

/// Which DAQ registers the mirrors and the sync line are wired to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaqChannels {
    /// Analog output driving the x galvo
    pub x: String,
    /// Analog output driving the y galvo
    pub y: String,
    /// Digital line observed by the counting instrument
    pub sync: String,
    /// Value written to `sync` while a pixel is being integrated
    pub sync_high: f64,
    /// Analog inputs reading back the galvo position signals
    #[serde(default)]
    pub monitor_x: Option<String>,
    #[serde(default)]
    pub monitor_y: Option<String>,
    /// Gain applied to monitor readings (the position outputs are divided by two)
    pub monitor_gain: f64,
}

impl Default for DaqChannels {
    fn default() -> Self {
        Self {
            x: "TDAC0".to_string(),
            y: "TDAC1".to_string(),
            sync: "FIO2".to_string(),
            sync_high: 1.0,
            monitor_x: Some("AIN0".to_string()),
            monitor_y: Some("AIN1".to_string()),
            monitor_gain: 2.0,
        }
    }
}

impl DaqChannels {
    /// Write both mirror voltages in one call
    pub fn write_pair<D: DaqInterface + ?Sized>(
        &self,
        daq: &mut D,
        pair: VoltagePair,
    ) -> Result<(), GalvoError> {
        daq.write_names(&[(self.x.as_str(), pair.x), (self.y.as_str(), pair.y)])
    }

    pub fn sync_on<D: DaqInterface + ?Sized>(&self, daq: &mut D) -> Result<(), GalvoError> {
        daq.write_name(&self.sync, self.sync_high)
    }

    pub fn sync_off<D: DaqInterface + ?Sized>(&self, daq: &mut D) -> Result<(), GalvoError> {
        daq.write_name(&self.sync, 0.0)
    }

    /// Read the position monitors, if both are wired
    pub fn read_monitors<D: DaqInterface + ?Sized>(
        &self,
        daq: &mut D,
    ) -> Result<Option<VoltagePair>, GalvoError> {
        match (&self.monitor_x, &self.monitor_y) {
            (Some(x), Some(y)) => {
                let x = daq.read_name(x)? * self.monitor_gain;
                let y = daq.read_name(y)? * self.monitor_gain;
                Ok(Some(VoltagePair::new(x, y)))
            }
            _ => Ok(None),
        }
    }
}
