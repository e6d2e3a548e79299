//! Fiber Bragg grating sensors and their calibration table.
//!
//! A [`Sensor`] is one grating with a fixed reference wavelength `λ0` and the
//! coefficients that turn a wavelength shift into a physical value. The
//! [`CalibrationTable`] is loaded once per session from CSV:
//!
//! ```text
//! id,channel,type,lambda0_nm,s0,s1,s2,k,tcs,cte,t0
//! t1,0,temperature,1530.0,21.0,95.0,0.0,,,,
//! e1,0,strain,1550.0,,,,0.78,6.5,,
//! ```
//!
//! `type` is case-insensitive. Strain rows default `cte` to 0 and `t0` to 30 °C
//! when those columns are empty.
//!
//! Only the current wavelength and reading of a sensor change during a session;
//! they are reset every cycle by [`registry::SensorRegistry::resolve`].

pub mod calibration;
pub mod registry;

use crate::core::Quantity;
use crate::error::{AppResult, DaqError};
use crate::instrument::CHANNEL_COUNT;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

pub use registry::SensorRegistry;

/// Default `cte` for strain sensors (1/°C).
pub const DEFAULT_CTE: f64 = 0.0;

/// Default reference temperature `t0` for strain sensors (°C).
pub const DEFAULT_T0: f64 = 30.0;

/// Conversion coefficients, by sensor type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SensorKind {
    /// `T = s2·Δλ² + s1·Δλ + s0`
    Temperature {
        /// Temperature at λ0 (°C)
        s0: f64,
        /// Linear coefficient (°C/nm)
        s1: f64,
        /// Quadratic coefficient (°C/nm²)
        s2: f64,
    },
    /// `ε = Δλ/(k·λ0)·1e6 − (cte + tcs)·(T − t0)`
    Strain {
        /// Gauge factor, non-zero
        k: f64,
        /// Temperature cross-sensitivity (µε/°C)
        tcs: f64,
        /// Thermal expansion of the host material (µε/°C)
        cte: f64,
        /// Temperature at which strain reads zero (°C)
        t0: f64,
    },
}

impl SensorKind {
    /// Quantity produced by this kind of sensor.
    pub fn quantity(&self) -> Quantity {
        match self {
            SensorKind::Temperature { .. } => Quantity::Temperature,
            SensorKind::Strain { .. } => Quantity::Strain,
        }
    }
}

/// One grating.
#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    name: String,
    channel: u8,
    lambda0: f64,
    kind: SensorKind,
    wavelength: Option<f64>,
    reading: Option<f64>,
}

impl Sensor {
    /// Creates a sensor with no current wavelength.
    pub fn new(name: impl Into<String>, channel: u8, lambda0: f64, kind: SensorKind) -> Self {
        Self {
            name: name.into(),
            channel,
            lambda0,
            kind,
            wavelength: None,
            reading: None,
        }
    }

    /// Temperature sensor.
    pub fn temperature(
        name: impl Into<String>,
        channel: u8,
        lambda0: f64,
        s0: f64,
        s1: f64,
        s2: f64,
    ) -> Self {
        Self::new(name, channel, lambda0, SensorKind::Temperature { s0, s1, s2 })
    }

    /// Strain sensor with the default `cte` and `t0`.
    pub fn strain(name: impl Into<String>, channel: u8, lambda0: f64, k: f64, tcs: f64) -> Self {
        Self::new(
            name,
            channel,
            lambda0,
            SensorKind::Strain {
                k,
                tcs,
                cte: DEFAULT_CTE,
                t0: DEFAULT_T0,
            },
        )
    }

    /// Identifier, unique within the table.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optical channel.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Reference wavelength (nm).
    pub fn lambda0(&self) -> f64 {
        self.lambda0
    }

    /// Conversion coefficients.
    pub fn kind(&self) -> &SensorKind {
        &self.kind
    }

    /// Peak matched to this sensor in the current cycle.
    pub fn wavelength(&self) -> Option<f64> {
        self.wavelength
    }

    /// Converted value of the current cycle.
    pub fn reading(&self) -> Option<f64> {
        self.reading
    }

    /// Wavelength shift `λ − λ0` of the current cycle.
    pub fn shift(&self) -> Option<f64> {
        self.wavelength.map(|wl| wl - self.lambda0)
    }

    /// True when a peak was matched this cycle.
    pub fn is_resolved(&self) -> bool {
        self.wavelength.is_some()
    }

    /// Starts a new cycle with the matched wavelength; clears the previous reading.
    pub(crate) fn resolve(&mut self, wavelength: Option<f64>) {
        self.wavelength = wavelength;
        self.reading = None;
    }

    pub(crate) fn set_reading(&mut self, reading: Option<f64>) {
        self.reading = reading;
    }

    fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(DaqError::Calibration("sensor id cannot be empty".into()));
        }
        if self.channel >= CHANNEL_COUNT {
            return Err(DaqError::Calibration(format!(
                "sensor '{}': channel {} out of range (0-{})",
                self.name,
                self.channel,
                CHANNEL_COUNT - 1
            )));
        }
        if !(self.lambda0.is_finite() && self.lambda0 > 0.0) {
            return Err(DaqError::Calibration(format!(
                "sensor '{}': lambda0 must be a positive wavelength, got {}",
                self.name, self.lambda0
            )));
        }
        let coefficients: Vec<f64> = match self.kind {
            SensorKind::Temperature { s0, s1, s2 } => vec![s0, s1, s2],
            SensorKind::Strain { k, tcs, cte, t0 } => {
                if k == 0.0 {
                    return Err(DaqError::Calibration(format!(
                        "sensor '{}': gauge factor k must be non-zero",
                        self.name
                    )));
                }
                vec![k, tcs, cte, t0]
            }
        };
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(DaqError::Calibration(format!(
                "sensor '{}': coefficients must be finite",
                self.name
            )));
        }
        Ok(())
    }
}

/// Row of the calibration CSV.
#[derive(Debug, Deserialize)]
struct CalibrationRow {
    id: String,
    channel: u8,
    #[serde(rename = "type")]
    kind: String,
    lambda0_nm: f64,
    s0: Option<f64>,
    s1: Option<f64>,
    s2: Option<f64>,
    k: Option<f64>,
    tcs: Option<f64>,
    cte: Option<f64>,
    t0: Option<f64>,
}

impl CalibrationRow {
    fn into_sensor(self) -> AppResult<Sensor> {
        let missing = |column: &str| {
            DaqError::Calibration(format!(
                "sensor '{}': column '{}' is required for type '{}'",
                self.id, column, self.kind
            ))
        };
        let kind = match self.kind.trim().to_ascii_lowercase().as_str() {
            "temperature" => SensorKind::Temperature {
                s0: self.s0.ok_or_else(|| missing("s0"))?,
                s1: self.s1.ok_or_else(|| missing("s1"))?,
                s2: self.s2.ok_or_else(|| missing("s2"))?,
            },
            "strain" => SensorKind::Strain {
                k: self.k.ok_or_else(|| missing("k"))?,
                tcs: self.tcs.ok_or_else(|| missing("tcs"))?,
                cte: self.cte.unwrap_or(DEFAULT_CTE),
                t0: self.t0.unwrap_or(DEFAULT_T0),
            },
            other => {
                return Err(DaqError::Calibration(format!(
                    "sensor '{}': unknown type '{}' (expected temperature or strain)",
                    self.id, other
                )))
            }
        };
        Ok(Sensor::new(self.id.trim(), self.channel, self.lambda0_nm, kind))
    }
}

/// The session's sensors, in table order.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    sensors: Vec<Sensor>,
}

impl CalibrationTable {
    /// Validates and wraps `sensors`.
    ///
    /// Identifiers must be unique and reference wavelengths on one channel must
    /// be at least `min_separation_nm` apart.
    pub fn new(sensors: Vec<Sensor>, min_separation_nm: f64) -> AppResult<Self> {
        let mut ids = HashSet::new();
        for sensor in &sensors {
            sensor.validate()?;
            if !ids.insert(sensor.name()) {
                return Err(DaqError::Calibration(format!(
                    "duplicate sensor id '{}'",
                    sensor.name()
                )));
            }
        }

        for (i, a) in sensors.iter().enumerate() {
            for b in sensors.iter().skip(i + 1) {
                if a.channel() == b.channel()
                    && (a.lambda0() - b.lambda0()).abs() < min_separation_nm
                {
                    return Err(DaqError::Calibration(format!(
                        "sensors '{}' and '{}' on channel {} are closer than {} nm",
                        a.name(),
                        b.name(),
                        a.channel(),
                        min_separation_nm
                    )));
                }
            }
        }

        Ok(Self { sensors })
    }

    /// Parses a CSV table from `reader`.
    pub fn from_reader<R: Read>(reader: R, min_separation_nm: f64) -> AppResult<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(reader);

        let mut sensors = Vec::new();
        for (i, row) in csv.deserialize::<CalibrationRow>().enumerate() {
            let row = row.map_err(|e| {
                DaqError::Calibration(format!("row {}: {}", i + 1, e))
            })?;
            sensors.push(row.into_sensor()?);
        }
        Self::new(sensors, min_separation_nm)
    }

    /// Loads a CSV table from `path`.
    pub fn load<P: AsRef<Path>>(path: P, min_separation_nm: f64) -> AppResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            DaqError::Calibration(format!("cannot open '{}': {}", path.display(), e))
        })?;
        let table = Self::from_reader(file, min_separation_nm)?;
        info!(
            "Loaded {} sensors from '{}' (channels {:?})",
            table.len(),
            path.display(),
            table.channels()
        );
        Ok(table)
    }

    /// Sensors in table order.
    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub(crate) fn sensors_mut(&mut self) -> &mut [Sensor] {
        &mut self.sensors
    }

    /// Looks up a sensor by identifier.
    pub fn get(&self, name: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.name() == name)
    }

    /// Number of sensors.
    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    /// True when the table has no sensors.
    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Channels that carry at least one sensor, ascending.
    pub fn channels(&self) -> Vec<u8> {
        let mut channels: Vec<u8> = self.sensors.iter().map(Sensor::channel).collect();
        channels.sort_unstable();
        channels.dedup();
        channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
id,channel,type,lambda0_nm,s0,s1,s2,k,tcs,cte,t0
t1,0,Temperature,1530.0,21.0,95.0,0.5,,,,
e1,0,STRAIN,1550.0,,,,0.78,6.5,,
e2,1,strain,1550.0,,,,0.78,6.5,12.0,20.0
";

    #[test]
    fn test_parse_table() {
        let table = CalibrationTable::from_reader(TABLE.as_bytes(), 0.5).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.channels(), vec![0, 1]);

        let t1 = table.get("t1").unwrap();
        assert_eq!(t1.channel(), 0);
        assert_eq!(
            *t1.kind(),
            SensorKind::Temperature {
                s0: 21.0,
                s1: 95.0,
                s2: 0.5
            }
        );
        assert!(!t1.is_resolved());
    }

    #[test]
    fn test_strain_defaults() {
        let table = CalibrationTable::from_reader(TABLE.as_bytes(), 0.5).unwrap();
        assert_eq!(
            *table.get("e1").unwrap().kind(),
            SensorKind::Strain {
                k: 0.78,
                tcs: 6.5,
                cte: DEFAULT_CTE,
                t0: DEFAULT_T0
            }
        );
        assert_eq!(
            *table.get("e2").unwrap().kind(),
            SensorKind::Strain {
                k: 0.78,
                tcs: 6.5,
                cte: 12.0,
                t0: 20.0
            }
        );
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let sensors = vec![
            Sensor::temperature("t1", 0, 1530.0, 21.0, 95.0, 0.0),
            Sensor::temperature("t1", 1, 1540.0, 21.0, 95.0, 0.0),
        ];
        let err = CalibrationTable::new(sensors, 0.5).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_close_references_on_same_channel() {
        let sensors = vec![
            Sensor::temperature("t1", 0, 1530.0, 21.0, 95.0, 0.0),
            Sensor::temperature("t2", 0, 1530.3, 21.0, 95.0, 0.0),
        ];
        assert!(CalibrationTable::new(sensors.clone(), 0.5).is_err());

        // Same wavelengths on different channels are fine.
        let sensors = vec![
            Sensor::temperature("t1", 0, 1530.0, 21.0, 95.0, 0.0),
            Sensor::temperature("t2", 1, 1530.0, 21.0, 95.0, 0.0),
        ];
        assert!(CalibrationTable::new(sensors, 0.5).is_ok());
    }

    #[test]
    fn test_rejects_zero_gauge_factor() {
        let sensors = vec![Sensor::strain("e1", 0, 1550.0, 0.0, 6.5)];
        assert!(CalibrationTable::new(sensors, 0.5).is_err());
    }

    #[test]
    fn test_rejects_bad_rows() {
        let unknown_type = "id,channel,type,lambda0_nm,s0,s1,s2,k,tcs,cte,t0\nx,0,pressure,1530,1,1,0,,,,\n";
        assert!(CalibrationTable::from_reader(unknown_type.as_bytes(), 0.5).is_err());

        let missing_k = "id,channel,type,lambda0_nm,s0,s1,s2,k,tcs,cte,t0\ne,0,strain,1550,,,,,6.5,,\n";
        let err = CalibrationTable::from_reader(missing_k.as_bytes(), 0.5).unwrap_err();
        assert!(err.to_string().contains("'k'"));

        let bad_channel = "id,channel,type,lambda0_nm,s0,s1,s2,k,tcs,cte,t0\nt,7,temperature,1530,1,1,0,,,,\n";
        assert!(CalibrationTable::from_reader(bad_channel.as_bytes(), 0.5).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = CalibrationTable::load("/nonexistent/calibration.csv", 0.5).unwrap_err();
        assert!(matches!(err, DaqError::Calibration(_)));
    }
}
