//! Wavelength shift to temperature and strain.
//!
//! # Conversion
//!
//! With `Δλ = λ − λ0`:
//!
//! ```text
//! T = s2·Δλ² + s1·Δλ + s0
//! ε = Δλ / (k·λ0) · 1e6 − (cte + tcs) · (T_ref − t0)
//! ```
//!
//! `T_ref` is the mean of every temperature sensor resolved in the same cycle.
//! When none resolved, strain is withheld rather than compensated with a
//! stale or default temperature.

use super::{CalibrationTable, Sensor, SensorKind};
use crate::core::{ReadingQuality, SensorSample};
use crate::error::{AppResult, DaqError};

/// Temperature polynomial.
pub fn temperature_from_shift(s0: f64, s1: f64, s2: f64, shift: f64) -> f64 {
    s2 * shift * shift + s1 * shift + s0
}

/// Temperature-compensated strain (µε).
pub fn strain_from_shift(
    k: f64,
    tcs: f64,
    cte: f64,
    t0: f64,
    lambda0: f64,
    shift: f64,
    reference_temperature: f64,
) -> f64 {
    shift / (k * lambda0) * 1e6 - (cte + tcs) * (reference_temperature - t0)
}

/// Temperature of a resolved temperature sensor.
///
/// Fails with [`DaqError::Unresolved`] when the sensor has no peak this cycle.
pub fn sensor_temperature(sensor: &Sensor) -> AppResult<f64> {
    let SensorKind::Temperature { s0, s1, s2 } = *sensor.kind() else {
        return Err(DaqError::Configuration(format!(
            "sensor '{}' is not a temperature sensor",
            sensor.name()
        )));
    };
    let shift = sensor
        .shift()
        .ok_or_else(|| DaqError::Unresolved(sensor.name().to_string()))?;
    Ok(temperature_from_shift(s0, s1, s2, shift))
}

/// Strain of a resolved strain sensor, compensated at `reference_temperature`.
pub fn sensor_strain(sensor: &Sensor, reference_temperature: Option<f64>) -> AppResult<f64> {
    let SensorKind::Strain { k, tcs, cte, t0 } = *sensor.kind() else {
        return Err(DaqError::Configuration(format!(
            "sensor '{}' is not a strain sensor",
            sensor.name()
        )));
    };
    let shift = sensor
        .shift()
        .ok_or_else(|| DaqError::Unresolved(sensor.name().to_string()))?;
    let reference = reference_temperature.ok_or(DaqError::NoReferenceTemperature)?;
    Ok(strain_from_shift(
        k,
        tcs,
        cte,
        t0,
        sensor.lambda0(),
        shift,
        reference,
    ))
}

/// Readings of one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    /// Mean temperature of the resolved temperature sensors
    pub reference_temperature: Option<f64>,
    /// One entry per sensor, in table order
    pub readings: Vec<SensorSample>,
}

/// Converts every resolved sensor of `table` and stores the readings on the sensors.
///
/// Temperatures are computed first so strain can be compensated in the same pass.
pub fn convert(table: &mut CalibrationTable) -> Conversion {
    let temperatures: Vec<f64> = table
        .sensors()
        .iter()
        .filter(|s| matches!(s.kind(), SensorKind::Temperature { .. }))
        .filter_map(|s| sensor_temperature(s).ok())
        .collect();
    let reference_temperature = if temperatures.is_empty() {
        None
    } else {
        Some(temperatures.iter().sum::<f64>() / temperatures.len() as f64)
    };

    let mut readings = Vec::with_capacity(table.len());
    for sensor in table.sensors_mut() {
        let result = match sensor.kind() {
            SensorKind::Temperature { .. } => sensor_temperature(sensor),
            SensorKind::Strain { .. } => sensor_strain(sensor, reference_temperature),
        };
        let (value, quality) = match result {
            Ok(value) => (Some(value), ReadingQuality::Ok),
            Err(e) => (
                None,
                ReadingQuality::from_error(&e).unwrap_or(ReadingQuality::Unresolved),
            ),
        };
        sensor.set_reading(value);
        readings.push(SensorSample {
            sensor: sensor.name().to_string(),
            channel: sensor.channel(),
            quantity: sensor.kind().quantity(),
            wavelength: sensor.wavelength(),
            value,
            trend: None,
            quality,
        });
    }

    Conversion {
        reference_temperature,
        readings,
    }
}
