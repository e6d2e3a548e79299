//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the device
//! driver, the sensor pipeline, the scheduler and the export worker. Using the
//! `thiserror` crate, every failure the acquisition path can produce maps onto
//! one variant, so callers can tell a dead link from a garbled reply from a
//! device that simply is not ready yet.
//!
//! ## Error Hierarchy
//!
//! - **`Disconnected`**: the transport could not be opened, or a connect/read/write
//!   exceeded its timeout.
//! - **`Protocol`**: the device answered, but the reply could not be decoded.
//! - **`DeviceNotReady`**: the interrogator is warming up. Callers must poll the
//!   status until it leaves `Warming`; nothing retries this automatically.
//! - **`Unresolved`** / **`NoReferenceTemperature`**: data-quality states of a
//!   single cycle. They surface inside a `Sample` and are never process errors.
//! - **`ExportFailure`**: the sample sink could not be written, even after the
//!   fallback file name was tried.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! which keeps the `?` operator usable across module boundaries.

use crate::config::ConfigError;
use crate::instrument::protocol::ProtocolError;
use crate::instrument::DeviceStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every error the acquisition system reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Loading the configuration file failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A configuration value is syntactically fine but semantically wrong.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The device could not be reached or did not answer in time.
    #[error("Device disconnected: {0}")]
    Disconnected(String),

    /// The device reply could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The device is in a state that does not accept the request.
    #[error("Device not ready (status {0})")]
    DeviceNotReady(DeviceStatus),

    /// No peak fell within tolerance of the sensor's reference wavelength.
    #[error("Sensor '{0}' has no peak within tolerance this cycle")]
    Unresolved(String),

    /// No temperature sensor resolved this cycle, so strain cannot be compensated.
    #[error("No reference temperature available this cycle")]
    NoReferenceTemperature,

    /// The calibration table could not be loaded or is inconsistent.
    #[error("Calibration table error: {0}")]
    Calibration(String),

    /// Writing a sample batch failed on both the target and the fallback file.
    #[error("Export to '{}' failed: {reason}", target.display())]
    ExportFailure {
        /// File the batch was meant for.
        target: PathBuf,
        /// Last failure reported by the sink.
        reason: String,
    },

    /// The operation is only allowed while the poller is paused.
    #[error("Poller must be paused for this operation")]
    PollerRunning,

    /// The poller task has already shut down.
    #[error("Poller is not running")]
    PollerStopped,
}

impl DaqError {
    /// True for failures of the link to the device (as opposed to bad data).
    pub fn is_transport(&self) -> bool {
        matches!(self, DaqError::Disconnected(_))
    }
}
