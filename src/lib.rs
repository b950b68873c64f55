pub mod acquisition;
pub mod cli;
pub mod config;
pub mod counter;
pub mod error;
pub mod job;
pub mod jog;
pub mod labjack;
pub mod logger;
pub mod optics;
pub mod planner;
pub mod plotting;
pub mod raster;
#[cfg(test)]
mod test_log;
pub mod timing;
pub mod types;

pub use acquisition::{Acquisition, ImageStats, ScanImage, acquire};
pub use config::{AppConfig, DaqBackend, load_config, load_config_or_default};
pub use counter::{CountingInstrument, GateConfig, SimulatedCounter, gaussian_spot};
pub use error::GalvoError;
pub use job::Job;
pub use jog::{JogController, JogExit, Key, KeySource, LineConsole, Prompt};
pub use labjack::{
    ConnectionConfig, DaqChannels, DaqInterface, LabJackClient, LabJackClientBuilder,
    SimulatedDaq,
};
pub use logger::{EventLog, EventRecord, read_event_log};
pub use optics::{GalvoScaling, OpticalModel};
pub use planner::{ScanConfig, ScanPlanner};
pub use plotting::{brightest_row, plot_row_profile, render_heatmap};
pub use raster::{RasterDriver, RasterState, ScanEvent, ScanStats, raster_path, reset};
pub use types::{
    Axis, AxisRange, DacRange, JogDirection, RasterMode, SavedPositions, ScanPlan, VoltagePair,
};
