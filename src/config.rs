use config::{Config, ConfigError, Environment, File};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::counter::GateConfig;
use crate::error::GalvoError;
use crate::labjack::{ConnectionConfig, DaqChannels, DaqInterface, LabJackClient, SimulatedDaq};
use crate::optics::OpticalModel;
use crate::planner::ScanConfig;
use crate::types::DacRange;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub daq: DaqConfig,
    pub dac: DacRange,
    pub optics: OpticalModel,
    pub scan: ScanConfig,
    pub counter: CounterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DaqBackend {
    #[default]
    Labjack,
    Simulated,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaqConfig {
    pub backend: DaqBackend,
    /// T7 host name or IP address
    pub address: String,
    pub port: u16,
    pub unit_id: u8,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub channels: DaqChannels,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CounterConfig {
    pub click_channel: i32,
    pub sync_channel: i32,
    pub trigger_level_v: f64,
    /// How often the image is refreshed while scanning
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub event_logging: bool,
    pub log_path: String,
    pub log_level: String,
    pub buffer_size: usize,
}

impl Default for DaqConfig {
    fn default() -> Self {
        Self {
            backend: DaqBackend::Labjack,
            address: "192.168.1.207".to_string(),
            port: 502,
            unit_id: 1,
            connect_timeout_ms: 5000,
            io_timeout_ms: 2000,
            channels: DaqChannels::default(),
        }
    }
}

impl Default for CounterConfig {
    fn default() -> Self {
        let gate = GateConfig::default();
        Self {
            click_channel: gate.click_channel,
            sync_channel: gate.sync_channel,
            trigger_level_v: gate.trigger_level_v,
            poll_interval_ms: 250,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            event_logging: true,
            log_path: "./logs".to_string(),
            log_level: "info".to_string(),
            buffer_size: 256,
        }
    }
}

impl DaqConfig {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.io_timeout_ms),
            write_timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }

    /// Open the configured device
    pub fn open(&self) -> Result<Box<dyn DaqInterface>, GalvoError> {
        match self.backend {
            DaqBackend::Labjack => {
                let client = LabJackClient::builder()
                    .address(&self.address)
                    .port(self.port)
                    .unit_id(self.unit_id)
                    .config(self.connection())
                    .build()?;
                Ok(Box::new(client))
            }
            DaqBackend::Simulated => {
                info!("Using simulated DAQ");
                Ok(Box::new(SimulatedDaq::new()))
            }
        }
    }
}

impl CounterConfig {
    /// Gate for a scan dwelling `integration` per pixel
    pub fn gate(&self, integration: Duration) -> GateConfig {
        GateConfig {
            click_channel: self.click_channel,
            sync_channel: self.sync_channel,
            trigger_level_v: self.trigger_level_v,
            ..GateConfig::for_integration_time(integration)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl LoggingConfig {
    pub fn event_log_file(&self, stem: &str) -> PathBuf {
        Path::new(&self.log_path).join(format!("{stem}.jsonl"))
    }
}

impl AppConfig {
    /// Drive the mirrors from the T7's own DAC0/DAC1 instead of an LJTick-DAC
    pub fn use_builtin_dac(&mut self) {
        self.dac = DacRange::t7_builtin();
        self.daq.channels.x = "DAC0".to_string();
        self.daq.channels.y = "DAC1".to_string();
    }

    pub fn validate(&self) -> Result<(), GalvoError> {
        self.dac.validate()?;
        self.scan.validate()?;

        if self.scan.width_um < 0.0 || self.scan.height_um < 0.0 {
            return Err(GalvoError::InvalidConfig(format!(
                "scan field {} x {} um has a negative side",
                self.scan.width_um, self.scan.height_um
            )));
        }
        if self.daq.backend == DaqBackend::Labjack && self.daq.address.trim().is_empty() {
            return Err(GalvoError::InvalidConfig(
                "daq.address is required for the labjack backend".to_string(),
            ));
        }
        if self.daq.channels.x == self.daq.channels.y {
            return Err(GalvoError::InvalidConfig(format!(
                "x and y galvos are both wired to {}",
                self.daq.channels.x
            )));
        }
        if self.counter.click_channel == self.counter.sync_channel {
            return Err(GalvoError::InvalidConfig(format!(
                "counter click and sync share channel {}",
                self.counter.click_channel
            )));
        }
        if self.logging.buffer_size == 0 {
            return Err(GalvoError::InvalidConfig(
                "logging.buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["galvo_config.toml", "config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // e.g. GALVO_SCAN__SCAN__SPACING=5
    builder = builder.add_source(
        Environment::with_prefix("GALVO_SCAN")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?.try_deserialize::<AppConfig>()?;
    config
        .validate()
        .map_err(|e| ConfigError::Message(e.to_string()))?;
    Ok(config)
}

/// Load configuration, falling back to defaults when loading fails
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
