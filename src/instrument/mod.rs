//! Interrogator backends.
//!
//! The acquisition pipeline talks to a [`DeviceBackend`] and never learns
//! whether a real BraggMeter ([`braggmeter::BraggMeter`]) or the synthetic
//! [`simulated::SimulatedDevice`] sits behind it. The backend is chosen from
//! `device.backend` in the configuration by [`from_settings`].

pub mod braggmeter;
pub mod protocol;
pub mod simulated;

use crate::adapters::TcpAdapter;
use crate::config::{DeviceBackendKind, Settings};
use crate::error::{AppResult, DaqError};
use crate::sensor::CalibrationTable;
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub use braggmeter::BraggMeter;
pub use simulated::SimulatedDevice;

/// Number of optical channels on the interrogator.
pub const CHANNEL_COUNT: u8 = 4;

/// Lower edge of the instrument's fixed optical band (nm).
pub const BAND_START_NM: f64 = 1500.0;

/// Upper edge of the instrument's fixed optical band (nm).
pub const BAND_END_NM: f64 = 1600.0;

/// Acquisition state reported by the interrogator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Ready, not acquiring.
    Idle,
    /// Acquisition running.
    Acquiring,
    /// Acquisition stopped by command.
    Stopped,
    /// Recoverable fault; a stop/start cycle clears it.
    Error,
    /// Light source still warming up; no command is accepted.
    Warming,
}

impl DeviceStatus {
    /// Maps a `:STAT?` code onto a status.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(DeviceStatus::Idle),
            2 => Some(DeviceStatus::Acquiring),
            3 => Some(DeviceStatus::Stopped),
            4 => Some(DeviceStatus::Error),
            5 => Some(DeviceStatus::Warming),
            _ => None,
        }
    }

    /// Status code as sent on the wire.
    pub fn code(&self) -> i64 {
        match self {
            DeviceStatus::Idle => 1,
            DeviceStatus::Acquiring => 2,
            DeviceStatus::Stopped => 3,
            DeviceStatus::Error => 4,
            DeviceStatus::Warming => 5,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceStatus::Idle => "Idle",
            DeviceStatus::Acquiring => "Acquiring",
            DeviceStatus::Stopped => "Stopped",
            DeviceStatus::Error => "Error",
            DeviceStatus::Warming => "Warming",
        };
        f.write_str(name)
    }
}

/// Operations the pipeline needs from an interrogator.
///
/// Implementations own the device status; it only changes through these
/// calls. Every call either completes or fails within the backend's
/// configured timeout.
#[async_trait]
pub trait DeviceBackend: Send {
    /// Human readable backend name for logs.
    fn name(&self) -> String;

    /// Status observed by the most recent exchange, if any.
    fn last_status(&self) -> Option<DeviceStatus>;

    /// Queries the current status.
    async fn status(&mut self) -> AppResult<DeviceStatus>;

    /// Brings the device into `Acquiring`.
    ///
    /// Fails with [`DaqError::DeviceNotReady`] while the device is warming up.
    async fn start(&mut self) -> AppResult<()>;

    /// Stops acquisition.
    async fn stop(&mut self) -> AppResult<()>;

    /// Peak wavelengths (nm) detected on `channel`.
    async fn acquire_peaks(&mut self, channel: u8) -> AppResult<Vec<f64>>;

    /// Optical spectrum of `channel` as `(wavelength_nm, intensity)` pairs.
    async fn acquire_trace(&mut self, channel: u8) -> AppResult<Vec<(f64, f64)>>;
}

/// Builds the backend selected in the configuration.
pub fn from_settings(
    settings: &Settings,
    table: &CalibrationTable,
) -> Box<dyn DeviceBackend> {
    match settings.device.backend {
        DeviceBackendKind::Real => {
            let adapter = TcpAdapter::new(
                settings.device.host.clone(),
                settings.device.port,
                settings.device.timeout,
            );
            Box::new(BraggMeter::new("braggmeter", adapter))
        }
        DeviceBackendKind::Simulated => {
            let sim = &settings.device.simulation;
            Box::new(
                SimulatedDevice::from_table(table)
                    .with_warmup(sim.warmup_polls)
                    .with_signal(sim.drift_nm, sim.noise_nm)
                    .with_dropout(sim.dropout),
            )
        }
    }
}

/// Polls the device until it leaves `Warming`.
///
/// Returns the first non-warming status. Transport and protocol errors are
/// propagated immediately; only `Warming` is waited out.
pub async fn wait_until_ready(
    backend: &mut dyn DeviceBackend,
    poll_interval: Duration,
    max_wait: Duration,
) -> AppResult<DeviceStatus> {
    let deadline = Instant::now() + max_wait;
    loop {
        let status = backend.status().await?;
        if status != DeviceStatus::Warming {
            info!("{} ready with status {}", backend.name(), status);
            return Ok(status);
        }
        if Instant::now() + poll_interval > deadline {
            warn!(
                "{} still warming after {:?}, giving up",
                backend.name(),
                max_wait
            );
            return Err(DaqError::DeviceNotReady(status));
        }
        info!("{} warming up, checking again in {:?}", backend.name(), poll_interval);
        sleep(poll_interval).await;
    }
}

/// Wavelength axis of a trace: `len` points spread evenly over the band.
pub fn band_axis(len: usize) -> Vec<f64> {
    match len {
        0 => Vec::new(),
        1 => vec![BAND_START_NM],
        n => {
            let step = (BAND_END_NM - BAND_START_NM) / (n - 1) as f64;
            (0..n).map(|i| BAND_START_NM + step * i as f64).collect()
        }
    }
}
