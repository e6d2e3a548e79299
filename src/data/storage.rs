//! Sample sinks.
//!
//! A [`SampleSink`] appends a batch of samples to a target file. Sinks are
//! synchronous; the export worker runs them on the blocking pool.

use crate::core::{Sample, SensorSample};
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;

/// Destination for sample batches.
pub trait SampleSink: Send + Sync {
    /// Appends `samples` to `target`, creating it if needed.
    ///
    /// Returns the number of rows written.
    fn write_batch(&self, target: &Path, samples: &[Sample]) -> Result<usize>;
}

/// Appends samples to a CSV file, one row per sample.
///
/// The header is written only when the file is new or empty, so repeated
/// batches extend one table:
///
/// ```text
/// timestamp,cycle,elapsed_s,status,reference_temperature_c,t1 wavelength_nm,t1 temperature_°C,...
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSampleWriter;

impl CsvSampleWriter {
    /// Creates a writer.
    pub fn new() -> Self {
        Self
    }

    fn header(sensors: &[SensorSample]) -> Vec<String> {
        let mut header = vec![
            "timestamp".to_string(),
            "cycle".to_string(),
            "elapsed_s".to_string(),
            "status".to_string(),
            "reference_temperature_c".to_string(),
        ];
        for sensor in sensors {
            header.push(format!("{} wavelength_nm", sensor.sensor));
            header.push(format!("{} {}_{}", sensor.sensor, sensor.quantity, sensor.quantity.unit()));
            header.push(format!("{} quality", sensor.sensor));
        }
        header
    }

    fn row(sample: &Sample) -> Vec<String> {
        let mut row = vec![
            sample.timestamp.to_rfc3339(),
            sample.cycle.to_string(),
            format!("{:.3}", sample.elapsed_s),
            sample.status.map(|s| s.to_string()).unwrap_or_default(),
            optional(sample.reference_temperature),
        ];
        for sensor in &sample.sensors {
            row.push(optional(sensor.wavelength));
            row.push(optional(sensor.value));
            row.push(format!("{:?}", sensor.quality));
        }
        row
    }
}

fn optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl SampleSink for CsvSampleWriter {
    fn write_batch(&self, target: &Path, samples: &[Sample]) -> Result<usize> {
        let Some(first) = samples.first() else {
            return Ok(0);
        };

        if let Some(dir) = target.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create storage directory at {:?}", dir))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(target)
            .with_context(|| format!("Failed to open CSV file at {:?}", target))?;
        let is_empty = file
            .metadata()
            .with_context(|| format!("Failed to stat CSV file at {:?}", target))?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);
        if is_empty {
            writer
                .write_record(Self::header(&first.sensors))
                .context("Failed to write CSV header")?;
        }
        for sample in samples {
            writer
                .write_record(Self::row(sample))
                .with_context(|| format!("Failed to write cycle {} to CSV", sample.cycle))?;
        }
        writer.flush().context("Failed to flush CSV writer")?;

        log::debug!("Appended {} samples to '{}'", samples.len(), target.display());
        Ok(samples.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Quantity, ReadingQuality};
    use crate::instrument::DeviceStatus;
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample(cycle: u64, value: Option<f64>) -> Sample {
        Sample {
            cycle,
            timestamp: Utc::now(),
            elapsed_s: cycle as f64,
            status: Some(DeviceStatus::Acquiring),
            peaks: Vec::new(),
            reference_temperature: value,
            sensors: vec![SensorSample {
                sensor: "t1".into(),
                channel: 0,
                quantity: Quantity::Temperature,
                wavelength: value.map(|_| 1530.05),
                value,
                trend: None,
                quality: if value.is_some() {
                    ReadingQuality::Ok
                } else {
                    ReadingQuality::Unresolved
                },
            }],
            segments_closed: vec![],
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let writer = CsvSampleWriter::new();

        assert_eq!(writer.write_batch(&path, &[sample(1, Some(21.0))]).unwrap(), 1);
        assert_eq!(
            writer
                .write_batch(&path, &[sample(2, None), sample(3, Some(21.5))])
                .unwrap(),
            2
        );

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("timestamp,cycle"));
        assert_eq!(contents.matches("timestamp").count(), 1);
        assert!(lines[2].ends_with(",,,Unresolved"));
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("run.csv");
        CsvSampleWriter::new()
            .write_batch(&path, &[sample(1, Some(20.0))])
            .unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        assert_eq!(CsvSampleWriter::new().write_batch(&path, &[]).unwrap(), 0);
        assert!(!path.exists());
    }
}
