//! Core data types shared by the acquisition pipeline and its consumers.
//!
//! # Data Flow
//!
//! ```text
//! DeviceBackend --[RawPeak]--> SensorRegistry --> calibration --> TrendSegmenter
//!                                                                    |
//!                               Poller --[CycleEvent]--> mpsc --> display / export
//! ```
//!
//! A [`Sample`] is the complete outcome of one successful peaks cycle. Values
//! that could not be computed are carried as `None` together with a
//! [`ReadingQuality`] explaining why; they are never silently replaced by a
//! stale or default value.

use crate::data::trend::TrendSegment;
use crate::error::DaqError;
use crate::instrument::DeviceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A peak wavelength reported by the device on one channel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawPeak {
    /// Optical channel the peak was detected on
    pub channel: u8,
    /// Peak wavelength (nm)
    pub wavelength: f64,
}

impl RawPeak {
    /// Tags every wavelength of `wavelengths` with `channel`.
    pub fn on_channel(channel: u8, wavelengths: &[f64]) -> Vec<RawPeak> {
        wavelengths
            .iter()
            .map(|&wavelength| RawPeak {
                channel,
                wavelength,
            })
            .collect()
    }
}

/// Physical quantity a sensor measures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    /// Degrees Celsius
    Temperature,
    /// Microstrain
    Strain,
}

impl Quantity {
    /// Unit label used in logs and export headers.
    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Temperature => "°C",
            Quantity::Strain => "µε",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Temperature => f.write_str("temperature"),
            Quantity::Strain => f.write_str("strain"),
        }
    }
}

/// Why a sensor's value is (or is not) present in a sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingQuality {
    /// Value computed from a matched peak.
    Ok,
    /// No peak within tolerance of the sensor's reference wavelength.
    Unresolved,
    /// Strain withheld because no temperature sensor resolved this cycle.
    NoReferenceTemperature,
}

impl ReadingQuality {
    /// Classifies a conversion error; `None` for errors that are not data-quality states.
    pub fn from_error(error: &DaqError) -> Option<Self> {
        match error {
            DaqError::Unresolved(_) => Some(ReadingQuality::Unresolved),
            DaqError::NoReferenceTemperature => Some(ReadingQuality::NoReferenceTemperature),
            _ => None,
        }
    }
}

/// One sensor's contribution to a sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Sensor identifier from the calibration table
    pub sensor: String,
    /// Optical channel
    pub channel: u8,
    /// What the sensor measures
    pub quantity: Quantity,
    /// Matched peak wavelength (nm)
    pub wavelength: Option<f64>,
    /// Converted value in `quantity.unit()`
    pub value: Option<f64>,
    /// Trend line value at this sample's time, once the trend has a fit
    pub trend: Option<f64>,
    /// Reason the value is absent, or `Ok`
    pub quality: ReadingQuality,
}

/// A trend segment closed while processing a sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentEvent {
    /// Sensor whose series was re-segmented
    pub sensor: String,
    /// The finished segment
    pub segment: TrendSegment,
}

/// Outcome of one successful peaks cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Cycle counter, starting at 1
    pub cycle: u64,
    /// Time the cycle started
    pub timestamp: DateTime<Utc>,
    /// Seconds since the poller started; x value of the trend series
    pub elapsed_s: f64,
    /// Device status seen during the cycle
    pub status: Option<DeviceStatus>,
    /// Peaks reported by the device, per channel in polling order
    pub peaks: Vec<RawPeak>,
    /// Mean of the resolved temperature sensors
    pub reference_temperature: Option<f64>,
    /// Every sensor of the calibration table, in table order
    pub sensors: Vec<SensorSample>,
    /// Trend segments closed by this sample
    pub segments_closed: Vec<SegmentEvent>,
}

impl Sample {
    /// Looks up a sensor by identifier.
    pub fn sensor(&self, name: &str) -> Option<&SensorSample> {
        self.sensors.iter().find(|s| s.sensor == name)
    }

    /// Number of sensors with a value this cycle.
    pub fn resolved_count(&self) -> usize {
        self.sensors.iter().filter(|s| s.value.is_some()).count()
    }
}

/// Optical spectrum of one channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelTrace {
    /// Optical channel
    pub channel: u8,
    /// `(wavelength_nm, intensity)` pairs in ascending wavelength
    pub points: Vec<(f64, f64)>,
}

/// Outcome of one successful spectrum cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpectrumFrame {
    /// Cycle counter, starting at 1
    pub cycle: u64,
    /// Time the cycle started
    pub timestamp: DateTime<Utc>,
    /// One trace per configured channel
    pub traces: Vec<ChannelTrace>,
}

/// A cycle that did not complete.
#[derive(Debug)]
pub struct CycleFailure {
    /// Cycle counter
    pub cycle: u64,
    /// Time the cycle started
    pub timestamp: DateTime<Utc>,
    /// What went wrong
    pub error: DaqError,
}

/// Everything the poller publishes.
#[derive(Debug)]
pub enum CycleEvent {
    /// Peaks cycle completed
    Sample(Sample),
    /// Spectrum cycle completed
    Spectrum(SpectrumFrame),
    /// Cycle failed; polling continues
    Failed(CycleFailure),
}

impl CycleEvent {
    /// Cycle counter of the event.
    pub fn cycle(&self) -> u64 {
        match self {
            CycleEvent::Sample(s) => s.cycle,
            CycleEvent::Spectrum(f) => f.cycle,
            CycleEvent::Failed(f) => f.cycle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peaks_tagged_with_channel() {
        let peaks = RawPeak::on_channel(2, &[1530.0, 1550.0]);
        assert_eq!(peaks.len(), 2);
        assert!(peaks.iter().all(|p| p.channel == 2));
        assert_eq!(peaks[1].wavelength, 1550.0);
    }

    #[test]
    fn test_quality_from_error() {
        assert_eq!(
            ReadingQuality::from_error(&DaqError::Unresolved("t1".into())),
            Some(ReadingQuality::Unresolved)
        );
        assert_eq!(
            ReadingQuality::from_error(&DaqError::NoReferenceTemperature),
            Some(ReadingQuality::NoReferenceTemperature)
        );
        assert_eq!(
            ReadingQuality::from_error(&DaqError::Disconnected("x".into())),
            None
        );
    }

    #[test]
    fn test_sample_serializes_to_json() {
        let sample = Sample {
            cycle: 1,
            timestamp: Utc::now(),
            elapsed_s: 0.0,
            status: Some(DeviceStatus::Acquiring),
            peaks: RawPeak::on_channel(0, &[1530.01]),
            reference_temperature: Some(21.5),
            sensors: vec![SensorSample {
                sensor: "t1".into(),
                channel: 0,
                quantity: Quantity::Temperature,
                wavelength: Some(1530.01),
                value: Some(21.5),
                trend: None,
                quality: ReadingQuality::Ok,
            }],
            segments_closed: vec![],
        };
        let json = serde_json::to_string(&sample).unwrap();
        assert!(json.contains("\"sensor\":\"t1\""));
        assert!(json.contains("\"quantity\":\"temperature\""));
        assert_eq!(sample.resolved_count(), 1);
        assert!(sample.sensor("t1").is_some());
    }
}
