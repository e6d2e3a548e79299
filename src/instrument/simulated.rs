//! A simulated interrogator that generates synthetic peaks and spectra.
//!
//! Each grating reflects near its reference wavelength with a slow sinusoidal
//! drift and uniform noise, which is enough to exercise matching, calibration
//! and trend segmentation without hardware. The status machine mirrors the
//! real device, including an optional warm-up phase.

use super::{band_axis, DeviceBackend, DeviceStatus, CHANNEL_COUNT};
use crate::error::{AppResult, DaqError};
use crate::sensor::CalibrationTable;
use async_trait::async_trait;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Points in a simulated trace.
const TRACE_POINTS: usize = 1001;

/// One reflecting grating on a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedGrating {
    /// Optical channel.
    pub channel: u8,
    /// Wavelength reflected at rest (nm).
    pub lambda0: f64,
}

/// Synthetic BraggMeter.
pub struct SimulatedDevice {
    gratings: Vec<SimulatedGrating>,
    status: DeviceStatus,
    warmup_polls: u32,
    drift_nm: f64,
    noise_nm: f64,
    dropout: f64,
    tick: u64,
    rng: StdRng,
}

impl SimulatedDevice {
    /// Creates a device reflecting at the given gratings, idle and warm.
    pub fn new(gratings: Vec<SimulatedGrating>) -> Self {
        Self {
            gratings,
            status: DeviceStatus::Idle,
            warmup_polls: 0,
            drift_nm: 0.05,
            noise_nm: 0.002,
            dropout: 0.0,
            tick: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// One grating per sensor of the calibration table.
    pub fn from_table(table: &CalibrationTable) -> Self {
        Self::new(
            table
                .sensors()
                .iter()
                .map(|sensor| SimulatedGrating {
                    channel: sensor.channel(),
                    lambda0: sensor.lambda0(),
                })
                .collect(),
        )
    }

    /// Report `Warming` for the next `polls` status queries.
    pub fn with_warmup(mut self, polls: u32) -> Self {
        self.warmup_polls = polls;
        if polls > 0 {
            self.status = DeviceStatus::Warming;
        }
        self
    }

    /// Peak-to-peak drift amplitude and noise amplitude in nm.
    pub fn with_signal(mut self, drift_nm: f64, noise_nm: f64) -> Self {
        self.drift_nm = drift_nm;
        self.noise_nm = noise_nm;
        self
    }

    /// Probability that a grating goes undetected in a cycle.
    pub fn with_dropout(mut self, probability: f64) -> Self {
        self.dropout = probability.clamp(0.0, 1.0);
        self
    }

    /// Deterministic noise for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn check_channel(channel: u8) -> AppResult<()> {
        if channel >= CHANNEL_COUNT {
            return Err(DaqError::Configuration(format!(
                "channel {} out of range (0-{})",
                channel,
                CHANNEL_COUNT - 1
            )));
        }
        Ok(())
    }

    fn check_ready(&self) -> AppResult<()> {
        if self.status == DeviceStatus::Warming {
            return Err(DaqError::DeviceNotReady(self.status));
        }
        Ok(())
    }

    fn current_wavelengths(&mut self, channel: u8) -> Vec<f64> {
        let phase = self.tick as f64 * 0.02;
        let mut peaks = Vec::new();
        for (i, grating) in self.gratings.iter().enumerate() {
            if grating.channel != channel {
                continue;
            }
            if self.dropout > 0.0 && self.rng.gen_bool(self.dropout) {
                continue;
            }
            let drift = 0.5 * self.drift_nm * (phase + i as f64).sin();
            let noise = if self.noise_nm > 0.0 {
                self.rng.gen_range(-self.noise_nm..self.noise_nm)
            } else {
                0.0
            };
            peaks.push(grating.lambda0 + drift + noise);
        }
        peaks
    }
}

#[async_trait]
impl DeviceBackend for SimulatedDevice {
    fn name(&self) -> String {
        format!("simulated BraggMeter ({} gratings)", self.gratings.len())
    }

    fn last_status(&self) -> Option<DeviceStatus> {
        Some(self.status)
    }

    async fn status(&mut self) -> AppResult<DeviceStatus> {
        if self.status == DeviceStatus::Warming {
            if self.warmup_polls == 0 {
                self.status = DeviceStatus::Idle;
            } else {
                self.warmup_polls -= 1;
                return Ok(DeviceStatus::Warming);
            }
        }
        Ok(self.status)
    }

    async fn start(&mut self) -> AppResult<()> {
        let status = self.status().await?;
        if status == DeviceStatus::Warming {
            return Err(DaqError::DeviceNotReady(status));
        }
        info!("Simulated BraggMeter started from {}", status);
        self.status = DeviceStatus::Acquiring;
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.check_ready()?;
        self.status = DeviceStatus::Stopped;
        info!("Simulated BraggMeter stopped");
        Ok(())
    }

    async fn acquire_peaks(&mut self, channel: u8) -> AppResult<Vec<f64>> {
        Self::check_channel(channel)?;
        self.check_ready()?;
        self.tick += 1;
        let peaks = self.current_wavelengths(channel);
        debug!("Simulated peaks on channel {}: {:?}", channel, peaks);
        Ok(peaks)
    }

    async fn acquire_trace(&mut self, channel: u8) -> AppResult<Vec<(f64, f64)>> {
        Self::check_channel(channel)?;
        self.check_ready()?;
        self.tick += 1;
        let peaks = self.current_wavelengths(channel);
        let width: f64 = 0.1;
        Ok(band_axis(TRACE_POINTS)
            .into_iter()
            .map(|wl| {
                let reflected: f64 = peaks
                    .iter()
                    .map(|p| 40.0 * (-((wl - p) / width).powi(2)).exp())
                    .sum();
                (wl, -60.0 + reflected)
            })
            .collect())
    }
}
