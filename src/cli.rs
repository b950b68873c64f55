//! Pieces shared by the command-line tools.

use config::ConfigError;
use env_logger::Env;
use log::{LevelFilter, info};
use std::path::Path;

use crate::config::{AppConfig, load_config, load_config_or_default};
use crate::types::VoltagePair;

/// Parse an `X,Y` voltage pair from the command line
pub fn parse_pair(s: &str) -> Result<VoltagePair, String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y, got {s}"))?;
    let x = x.trim().parse::<f64>().map_err(|e| format!("bad x voltage: {e}"))?;
    let y = y.trim().parse::<f64>().map_err(|e| format!("bad y voltage: {e}"))?;
    Ok(VoltagePair::new(x, y))
}

pub fn parse_level(log_level: &str) -> Option<LevelFilter> {
    match log_level.to_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        "off" => Some(LevelFilter::Off),
        _ => None,
    }
}

/// Initialize logging with configurable level
///
/// The logger accepts every level and the global maximum does the
/// filtering, so [`set_log_level`] can change it once the configuration
/// is known.
pub fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default())
        .filter_level(LevelFilter::Trace)
        .format_timestamp_millis()
        .try_init()?;
    set_log_level(log_level);
    Ok(())
}

pub fn set_log_level(log_level: &str) {
    let level = parse_level(log_level).unwrap_or_else(|| {
        eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
        LevelFilter::Info
    });
    log::set_max_level(level);
}

/// Configuration for a tool run
///
/// A file named on the command line must load and validate; only the
/// search-path lookup falls back to defaults.
pub fn load_app_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match config_path {
        Some(path) => {
            let config = load_config(Some(path))?;
            info!("Configuration loaded from {}", path.display());
            Ok(config)
        }
        None => Ok(load_config_or_default(None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_pair() {
        assert_eq!(parse_pair("0.5, -1").unwrap(), VoltagePair::new(0.5, -1.0));
        assert!(parse_pair("0.5").is_err());
        assert!(parse_pair("a,1").is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("warn"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_named_config_file_errors_are_not_swallowed() {
        let path = std::env::temp_dir().join(format!("galvo-cli-{}-bad.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"[dac]\nmin = 5.0\nmax = -5.0\nbits = 14\n").unwrap();

        assert!(load_app_config(Some(&path)).is_err());
        assert!(load_app_config(Some(Path::new("/nonexistent/galvo.toml"))).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
