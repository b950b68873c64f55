use thiserror::Error;

use crate::types::Axis;

#[derive(Error, Debug)]
pub enum GalvoError {
    #[error("IO error: {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Connection timeout")]
    Timeout,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Device exception: function 0x{function:02x} returned code {code}")]
    DeviceException { function: u8, code: u8 },
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Outside optical model domain: {0}")]
    Domain(String),
    #[error("{axis} limit reached: {value:.6} V is outside the DAC bound {bound} V")]
    Limit { axis: Axis, value: f64, bound: f64 },
    #[error("{0} invalid save name")]
    Lookup(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Device handle already released")]
    DeviceClosed,
    #[error("Failed to release device: {0}")]
    Release(String),
    #[error("Raster worker failed: {0}")]
    Worker(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<std::io::Error> for GalvoError {
    fn from(source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::TimedOut
            || source.kind() == std::io::ErrorKind::WouldBlock
        {
            return GalvoError::Timeout;
        }
        GalvoError::Io {
            source,
            context: "I/O operation failed".to_string(),
        }
    }
}

impl GalvoError {
    /// Errors a jog session reports and then keeps running after.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GalvoError::Domain(_) | GalvoError::Limit { .. } | GalvoError::Lookup(_)
        )
    }
}
