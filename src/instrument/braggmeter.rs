//! BraggMeter optical interrogator driver
//!
//! This module provides a [`DeviceBackend`] implementation for the BraggMeter
//! FBG interrogator over its line protocol (see [`super::protocol`]).
//!
//! ## Configuration
//!
//! ```toml
//! [device]
//! backend = "real"
//! host = "10.0.0.150"
//! port = 3500
//! timeout = "10s"
//! ```
//!
//! ## Status handling
//!
//! - `start()` from `Idle` sends `START`.
//! - `start()` from `Stopped` or `Error` sends `STOP` then `START`.
//! - `start()` while `Warming` fails with `DeviceNotReady`; the caller polls
//!   `status()` until warm-up finishes.
//! - Once a `Warming` status has been seen, each acquire re-reads the status
//!   first. It keeps failing with `DeviceNotReady` until warm-up ends, then
//!   starts acquisition and carries on.
//! - A failed peak read triggers exactly one `start()` and one re-read before
//!   the error is reported.

use super::protocol::{self, Command, ParsedResponse, ProtocolError};
use super::{band_axis, DeviceBackend, DeviceStatus, CHANNEL_COUNT};
use crate::adapters::Adapter;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use log::{debug, info, warn};

/// BraggMeter driver over any [`Adapter`].
pub struct BraggMeter<A: Adapter> {
    id: String,
    adapter: A,
    status: Option<DeviceStatus>,
}

impl<A: Adapter> BraggMeter<A> {
    /// Creates a driver. No traffic happens until the first call.
    pub fn new(id: impl Into<String>, adapter: A) -> Self {
        Self {
            id: id.into(),
            adapter,
            status: None,
        }
    }

    /// Underlying transport.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    async fn ask(&self, command: Command) -> AppResult<ParsedResponse> {
        let raw = self.adapter.exchange(&command.encode()).await?;
        let parsed = protocol::decode(&raw, command.response_kind())?;
        debug!("[{}] {} -> {:?}", self.id, command, parsed);
        Ok(parsed)
    }

    async fn ask_values(&self, command: Command) -> AppResult<Vec<f64>> {
        match self.ask(command).await? {
            ParsedResponse::Values(values) => Ok(values),
            other => Err(ProtocolError::Malformed(format!(
                "expected values in reply to {}, got {:?}",
                command, other
            ))
            .into()),
        }
    }

    fn check_channel(&self, channel: u8) -> AppResult<()> {
        if channel >= CHANNEL_COUNT {
            return Err(DaqError::Configuration(format!(
                "channel {} out of range (0-{})",
                channel,
                CHANNEL_COUNT - 1
            )));
        }
        Ok(())
    }
}

impl<A: Adapter + 'static> BraggMeter<A> {
    /// Re-polls a device last seen warming; starts it once warm-up is over.
    async fn ensure_warm(&mut self) -> AppResult<()> {
        if self.status == Some(DeviceStatus::Warming) {
            self.start().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<A: Adapter + 'static> DeviceBackend for BraggMeter<A> {
    fn name(&self) -> String {
        format!("BraggMeter '{}' ({})", self.id, self.adapter.endpoint())
    }

    fn last_status(&self) -> Option<DeviceStatus> {
        self.status
    }

    async fn status(&mut self) -> AppResult<DeviceStatus> {
        let code = match self.ask(Command::Status).await? {
            ParsedResponse::Status(code) => code,
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "expected status code, got {:?}",
                    other
                ))
                .into())
            }
        };
        let status = DeviceStatus::from_code(code).ok_or(ProtocolError::UnknownStatus(code))?;
        debug!("[{}] status code {} ({})", self.id, code, status);
        self.status = Some(status);
        Ok(status)
    }

    async fn start(&mut self) -> AppResult<()> {
        let status = self.status().await?;
        info!("BraggMeter '{}' status: {}", self.id, status);

        match status {
            DeviceStatus::Idle => {
                self.ask(Command::Start).await?;
            }
            DeviceStatus::Stopped | DeviceStatus::Error => {
                self.ask(Command::Stop).await?;
                self.ask(Command::Start).await?;
            }
            DeviceStatus::Warming => {
                warn!("BraggMeter '{}' is warming up", self.id);
                return Err(DaqError::DeviceNotReady(status));
            }
            DeviceStatus::Acquiring => {
                debug!("BraggMeter '{}' already acquiring", self.id);
            }
        }

        self.status = Some(DeviceStatus::Acquiring);
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.ask(Command::Stop).await?;
        let status = self.status().await?;
        info!("BraggMeter '{}' status after stop: {}", self.id, status);
        Ok(())
    }

    async fn acquire_peaks(&mut self, channel: u8) -> AppResult<Vec<f64>> {
        self.check_channel(channel)?;
        self.ensure_warm().await?;

        match self.ask_values(Command::Peaks(channel)).await {
            Ok(peaks) => Ok(peaks),
            Err(e) => {
                warn!(
                    "BraggMeter '{}' failed to read peaks on channel {}: {}; restarting acquisition",
                    self.id, channel, e
                );
                self.start().await?;
                self.ask_values(Command::Peaks(channel)).await
            }
        }
    }

    async fn acquire_trace(&mut self, channel: u8) -> AppResult<Vec<(f64, f64)>> {
        self.check_channel(channel)?;
        self.ensure_warm().await?;

        let intensities = self.ask_values(Command::Trace(channel)).await?;
        Ok(band_axis(intensities.len())
            .into_iter()
            .zip(intensities)
            .collect())
    }
}
