//! Configuration system using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (usually `config/default.toml`)
//! 3. Environment variables prefixed with `BRAGGDAQ_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! BRAGGDAQ_APPLICATION__LOG_LEVEL=debug
//! BRAGGDAQ_DEVICE__HOST=192.168.1.20
//! BRAGGDAQ_DEVICE__BACKEND=simulated
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bragg_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/default.toml")?;
//! println!("Polling {:?} every {:?}", settings.acquisition.channels, settings.acquisition.interval);
//! # Ok::<(), bragg_daq::config::ConfigError>(())
//! ```

use crate::instrument::CHANNEL_COUNT;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file or an environment override could not be parsed.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value parsed but is out of range or inconsistent.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
    /// The settings could not be rendered back to TOML.
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Interrogator connection
    pub device: DeviceConfig,
    /// Polling schedule
    pub acquisition: AcquisitionConfig,
    /// Calibration table and peak matching
    pub calibration: CalibrationConfig,
    /// Trend segmentation
    pub trend: TrendConfig,
    /// Sample export
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Which interrogator implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceBackendKind {
    /// A BraggMeter on the network.
    Real,
    /// Synthetic peaks generated from the calibration table.
    Simulated,
}

/// Interrogator connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Backend selection
    pub backend: DeviceBackendKind,
    /// Device host name or address
    pub host: String,
    /// Device TCP port
    pub port: u16,
    /// Timeout for each connect, write and read
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Status poll period while the device warms up
    #[serde(with = "humantime_serde")]
    pub warmup_poll: Duration,
    /// Give up waiting for warm-up after this long
    #[serde(with = "humantime_serde")]
    pub warmup_timeout: Duration,
    /// Parameters of the simulated backend
    pub simulation: SimulationConfig,
}

/// Parameters of the simulated backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Status queries answered with `Warming` before the device is ready
    pub warmup_polls: u32,
    /// Drift amplitude (nm)
    pub drift_nm: f64,
    /// Noise amplitude (nm)
    pub noise_nm: f64,
    /// Probability that a grating is missed in a cycle
    pub dropout: f64,
}

/// What each cycle fetches from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    /// Peak wavelengths, converted to temperature/strain.
    Peaks,
    /// Full optical spectrum per channel.
    Spectrum,
}

/// Polling schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Period between cycle starts
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Channels read every cycle
    pub channels: Vec<u8>,
    /// Peaks or spectrum
    pub mode: AcquisitionMode,
    /// Capacity of the sample channel towards consumers
    pub channel_capacity: usize,
}

/// Calibration table and peak matching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// CSV calibration table
    pub table: PathBuf,
    /// Maximum distance (nm) between a peak and a sensor's reference wavelength
    pub tolerance_nm: f64,
    /// Minimum distance (nm) between reference wavelengths on one channel
    pub min_separation_nm: f64,
}

/// Trend segmentation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendConfig {
    /// Points a segment needs before it is fitted
    pub min_points: usize,
    /// Points after which a segment is closed regardless of fit
    pub max_points: usize,
    /// Largest residual tolerated, in the signal's own unit
    pub threshold: f64,
    /// Width of the plotting window along x (seconds)
    pub display_window: f64,
}

/// Sample export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory export files are written to
    pub output_dir: PathBuf,
    /// Export file name inside `output_dir`
    pub file_name: String,
    /// Samples buffered before a batch is handed to the export worker
    pub flush_every: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "BraggMeter DAQ".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: DeviceBackendKind::Real,
            host: "10.0.0.150".to_string(),
            port: 3500,
            timeout: Duration::from_secs(10),
            warmup_poll: Duration::from_secs(5),
            warmup_timeout: Duration::from_secs(600),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            warmup_polls: 0,
            drift_nm: 0.05,
            noise_nm: 0.002,
            dropout: 0.0,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            channels: vec![0],
            mode: AcquisitionMode::Peaks,
            channel_capacity: 256,
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            table: PathBuf::from("config/calibration.csv"),
            tolerance_nm: 2.5,
            min_separation_nm: 0.5,
        }
    }
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            min_points: 10,
            max_points: 60,
            threshold: 5.0,
            display_window: 600.0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            file_name: "braggmeter.csv".to_string(),
            flush_every: 60,
        }
    }
}

impl StorageConfig {
    /// Full path of the export file.
    pub fn target(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }
}

impl Settings {
    /// Load defaults, then `path`, then `BRAGGDAQ_` environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if a source cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BRAGGDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string layered over the defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective settings as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.device.backend == DeviceBackendKind::Real {
            if self.device.host.is_empty() {
                return Err(invalid("device.host cannot be empty".to_string()));
            }
            if self.device.port == 0 {
                return Err(invalid("device.port must be > 0".to_string()));
            }
        }
        if self.device.timeout.is_zero() {
            return Err(invalid("device.timeout must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.device.simulation.dropout) {
            return Err(invalid(format!(
                "device.simulation.dropout {} must be within 0-1",
                self.device.simulation.dropout
            )));
        }

        if self.acquisition.interval.is_zero() {
            return Err(invalid("acquisition.interval must be > 0".to_string()));
        }
        if self.acquisition.channel_capacity == 0 {
            return Err(invalid(
                "acquisition.channel_capacity must be > 0".to_string(),
            ));
        }
        validate_channels(&self.acquisition.channels)?;

        if !(self.calibration.tolerance_nm > 0.0) {
            return Err(invalid(format!(
                "calibration.tolerance_nm {} must be > 0",
                self.calibration.tolerance_nm
            )));
        }
        if !(self.calibration.min_separation_nm >= 0.0) {
            return Err(invalid(format!(
                "calibration.min_separation_nm {} must be >= 0",
                self.calibration.min_separation_nm
            )));
        }

        if self.trend.min_points < 2 {
            return Err(invalid("trend.min_points must be >= 2".to_string()));
        }
        if self.trend.max_points <= self.trend.min_points {
            return Err(invalid(format!(
                "trend.max_points ({}) must exceed trend.min_points ({})",
                self.trend.max_points, self.trend.min_points
            )));
        }
        if !(self.trend.threshold > 0.0) || !(self.trend.display_window > 0.0) {
            return Err(invalid(
                "trend.threshold and trend.display_window must be > 0".to_string(),
            ));
        }

        if self.storage.file_name.is_empty() {
            return Err(invalid("storage.file_name cannot be empty".to_string()));
        }
        if self.storage.flush_every == 0 {
            return Err(invalid("storage.flush_every must be > 0".to_string()));
        }

        Ok(())
    }
}

/// Checks a channel list: non-empty, unique, within the device's channels.
pub fn validate_channels(channels: &[u8]) -> Result<(), ConfigError> {
    if channels.is_empty() {
        return Err(invalid("at least one channel is required".to_string()));
    }
    let mut seen = HashSet::new();
    for &channel in channels {
        if channel >= CHANNEL_COUNT {
            return Err(invalid(format!(
                "channel {} out of range (0-{})",
                channel,
                CHANNEL_COUNT - 1
            )));
        }
        if !seen.insert(channel) {
            return Err(invalid(format!("duplicate channel {}", channel)));
        }
    }
    Ok(())
}

fn invalid(message: String) -> ConfigError {
    ConfigError::ValidationError(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.device.port, 3500);
        assert_eq!(settings.calibration.tolerance_nm, 2.5);
        assert_eq!(settings.trend.min_points, 10);
        assert_eq!(settings.trend.max_points, 60);
        assert_eq!(settings.storage.target(), PathBuf::from("data/braggmeter.csv"));
    }

    #[test]
    fn test_partial_toml_overrides_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [device]
            backend = "simulated"
            timeout = "250ms"

            [acquisition]
            interval = "2s"
            channels = [0, 2]
            mode = "spectrum"
            "#,
        )
        .unwrap();

        assert_eq!(settings.device.backend, DeviceBackendKind::Simulated);
        assert_eq!(settings.device.timeout, Duration::from_millis(250));
        assert_eq!(settings.device.host, "10.0.0.150");
        assert_eq!(settings.acquisition.interval, Duration::from_secs(2));
        assert_eq!(settings.acquisition.channels, vec![0, 2]);
        assert_eq!(settings.acquisition.mode, AcquisitionMode::Spectrum);
    }

    #[test]
    fn test_invalid_log_level() {
        let err = Settings::from_toml_str("[application]\nlog_level = \"loud\"").unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn test_channel_validation() {
        assert!(validate_channels(&[0, 1, 2, 3]).is_ok());
        assert!(validate_channels(&[]).is_err());
        assert!(validate_channels(&[4]).is_err());
        assert!(validate_channels(&[1, 1]).is_err());
    }

    #[test]
    fn test_trend_bounds_validation() {
        let mut settings = Settings::default();
        settings.trend.max_points = settings.trend.min_points;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.trend.threshold = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let settings = Settings::default();
        let rendered = settings.to_toml().unwrap();
        assert_eq!(Settings::from_toml_str(&rendered).unwrap(), settings);
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "bragg.toml",
                r#"
                [device]
                host = "192.168.0.7"
                "#,
            )?;
            jail.set_env("BRAGGDAQ_DEVICE__PORT", "4000");
            let settings = Settings::load_from("bragg.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.device.host, "192.168.0.7");
            assert_eq!(settings.device.port, 4000);
            Ok(())
        });
    }
}
