//! Matching device peaks to sensors.
//!
//! Every cycle, each sensor claims the peak on its own channel closest to its
//! reference wavelength, provided the distance is strictly below the
//! tolerance. Sensors claim independently: one peak may satisfy two sensors,
//! and a sensor with no peak in range is unresolved for this cycle only.

use super::CalibrationTable;
use crate::core::RawPeak;
use log::debug;
use std::collections::BTreeMap;

/// Default matching tolerance (nm).
pub const DEFAULT_TOLERANCE_NM: f64 = 2.5;

/// The calibration table plus the per-cycle peak assignment.
#[derive(Debug, Clone)]
pub struct SensorRegistry {
    table: CalibrationTable,
    tolerance_nm: f64,
}

impl SensorRegistry {
    /// Wraps a loaded table.
    pub fn new(table: CalibrationTable, tolerance_nm: f64) -> Self {
        Self {
            table,
            tolerance_nm,
        }
    }

    /// The sensors and their current state.
    pub fn table(&self) -> &CalibrationTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut CalibrationTable {
        &mut self.table
    }

    /// Matching tolerance (nm).
    pub fn tolerance_nm(&self) -> f64 {
        self.tolerance_nm
    }

    /// Closest in-tolerance wavelength per sensor, without touching sensor state.
    ///
    /// On equal distance the peak reported first wins.
    pub fn match_peaks(&self, peaks: &[RawPeak]) -> BTreeMap<String, Option<f64>> {
        self.table
            .sensors()
            .iter()
            .map(|sensor| {
                let mut best: Option<(f64, f64)> = None;
                for peak in peaks.iter().filter(|p| p.channel == sensor.channel()) {
                    let distance = (peak.wavelength - sensor.lambda0()).abs();
                    if distance >= self.tolerance_nm {
                        continue;
                    }
                    match best {
                        Some((best_distance, _)) if best_distance <= distance => {}
                        _ => best = Some((distance, peak.wavelength)),
                    }
                }
                (sensor.name().to_string(), best.map(|(_, wl)| wl))
            })
            .collect()
    }

    /// Assigns this cycle's wavelengths; every sensor is overwritten, matched or not.
    ///
    /// Returns the number of resolved sensors.
    pub fn resolve(&mut self, peaks: &[RawPeak]) -> usize {
        let matches = self.match_peaks(peaks);
        let mut resolved = 0;
        for sensor in self.table.sensors_mut() {
            let wavelength = matches.get(sensor.name()).copied().flatten();
            if wavelength.is_some() {
                resolved += 1;
            } else {
                debug!(
                    "Sensor '{}' unresolved: no peak within {} nm of {} nm on channel {}",
                    sensor.name(),
                    self.tolerance_nm,
                    sensor.lambda0(),
                    sensor.channel()
                );
            }
            sensor.resolve(wavelength);
        }
        resolved
    }
}
