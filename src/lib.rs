//! Core library for the bragg_daq application.
//!
//! Polls a BraggMeter fiber-optic interrogator, matches the reported peak
//! wavelengths to calibrated Bragg grating sensors, converts them to
//! temperature and strain, tracks a piecewise-linear trend per sensor and
//! exports samples to CSV. A simulated interrogator stands in for the device
//! when no hardware is available.

pub mod adapters;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod instrument;
pub mod poller;
pub mod sensor;
