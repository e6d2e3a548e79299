//! End-to-end acquisition with the simulated interrogator and CSV export.

use bragg_daq::adapters::MockAdapter;
use bragg_daq::config::{AcquisitionMode, Settings, TrendConfig};
use bragg_daq::core::{CycleEvent, ReadingQuality};
use bragg_daq::data::export::{ExportResult, ExportWorker};
use bragg_daq::data::storage::{CsvSampleWriter, SampleSink};
use bragg_daq::data::trend::TrendSegmenter;
use bragg_daq::instrument::{BraggMeter, DeviceStatus};
use bragg_daq::poller::{AcquisitionPipeline, Poller};
use bragg_daq::sensor::{CalibrationTable, SensorRegistry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;

const TABLE: &str = "\
id,channel,type,lambda0_nm,s0,s1,s2,k,tcs,cte,t0
T1,0,temperature,1530.0,21.0,95.0,0.0,,,,
S1,0,strain,1545.0,,,,0.78,6.37,,
T2,1,temperature,1535.0,21.0,95.0,0.0,,,,
";

fn simulated_settings(dir: &Path) -> Settings {
    let table = dir.join("calibration.csv");
    std::fs::write(&table, TABLE).unwrap();
    Settings::from_toml_str(&format!(
        r#"
        [device]
        backend = "simulated"

        [acquisition]
        interval = "5ms"
        channels = [0, 1]

        [calibration]
        table = "{}"

        [storage]
        output_dir = "{}"
        flush_every = 5
        "#,
        table.display(),
        dir.display()
    ))
    .unwrap()
}

#[tokio::test]
async fn test_simulated_pipeline_resolves_every_sensor() {
    let dir = tempdir().unwrap();
    let settings = simulated_settings(dir.path());
    let mut pipeline = AcquisitionPipeline::from_settings(&settings).unwrap();
    pipeline.start_device().await.unwrap();

    for _ in 0..15 {
        let CycleEvent::Sample(sample) = pipeline.run_cycle().await else {
            panic!("expected a sample");
        };
        assert_eq!(sample.resolved_count(), 3);
        assert!(sample
            .sensors
            .iter()
            .all(|s| s.quality == ReadingQuality::Ok));
        let temperature = sample.reference_temperature.unwrap();
        assert!((temperature - 21.0).abs() < 5.0);
    }

    let trend = pipeline.trend().series("T1").unwrap();
    assert_eq!(trend.len(), 15);
    assert!(trend.current_fit().is_some());
}

#[tokio::test]
async fn test_poller_samples_export_to_csv() {
    let dir = tempdir().unwrap();
    let settings = simulated_settings(dir.path());
    let pipeline = AcquisitionPipeline::from_settings(&settings).unwrap();

    let (tx, mut rx) = mpsc::channel(32);
    let poller = Poller::spawn(pipeline, settings.acquisition.interval, tx);
    let mut samples = Vec::new();
    while samples.len() < settings.storage.flush_every {
        if let CycleEvent::Sample(sample) = rx.recv().await.unwrap() {
            samples.push(sample);
        }
    }
    poller.shutdown().await.unwrap();

    let (worker, mut results) = ExportWorker::new(Arc::new(CsvSampleWriter::new()));
    worker.submit(samples, settings.storage.target()).unwrap();
    worker.finish().await;
    let result = results.recv().await.unwrap();
    assert!(matches!(result, ExportResult::Written { rows: 5, .. }), "{result:?}");

    let contents = std::fs::read_to_string(settings.storage.target()).unwrap();
    let mut lines = contents.lines();
    let header = lines.next().unwrap();
    assert!(header.contains("T1 wavelength_nm"));
    assert!(header.contains("S1 strain_µε"));
    assert_eq!(lines.count(), 5);
}

#[test]
fn test_unwritable_target_falls_back() {
    let dir = tempdir().unwrap();
    // A directory where the file should be cannot be opened for appending.
    let target = dir.path().join("run.csv");
    std::fs::create_dir(&target).unwrap();

    let result = bragg_daq::data::export::export_batch(&CsvSampleWriter::new(), &target, &[]);
    // An empty batch never touches the disk.
    assert!(matches!(result, ExportResult::Written { rows: 0, .. }));

    let sample = {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let settings = simulated_settings(dir.path());
        runtime.block_on(async {
            let mut pipeline = AcquisitionPipeline::from_settings(&settings).unwrap();
            pipeline.start_device().await.unwrap();
            pipeline.measure_once().await.unwrap()
        })
    };
    let result =
        bragg_daq::data::export::export_batch(&CsvSampleWriter::new(), &target, &[sample.clone()]);
    let ExportResult::Fallback { written, rows, .. } = result else {
        panic!("expected fallback, got {:?}", result);
    };
    assert_eq!(rows, 1);
    assert!(written.is_file());
    assert!(CsvSampleWriter::new().write_batch(&written, &[sample]).is_ok());
}

#[tokio::test]
async fn test_strain_withheld_when_temperature_missing() {
    let table = CalibrationTable::from_reader(TABLE.as_bytes(), 0.5).unwrap();
    let adapter = MockAdapter::with_status(DeviceStatus::Idle);
    // Only the strain grating reflects; T1 and T2 are dark.
    adapter.set_reply(bragg_daq::instrument::protocol::Command::Peaks(0), "1545.1");
    adapter.set_reply(bragg_daq::instrument::protocol::Command::Peaks(1), "");

    let mut pipeline = AcquisitionPipeline::new(
        Box::new(BraggMeter::new("mock", adapter.clone())),
        SensorRegistry::new(table, 2.5),
        TrendSegmenter::new(TrendConfig::default()),
        vec![0, 1],
        AcquisitionMode::Peaks,
    )
    .unwrap();
    pipeline.start_device().await.unwrap();

    let CycleEvent::Sample(sample) = pipeline.run_cycle().await else {
        panic!("expected a sample");
    };
    assert_eq!(sample.reference_temperature, None);
    let strain = sample.sensor("S1").unwrap();
    assert_eq!(strain.wavelength, Some(1545.1));
    assert_eq!(strain.value, None);
    assert_eq!(strain.quality, ReadingQuality::NoReferenceTemperature);
    assert_eq!(sample.sensor("T1").unwrap().quality, ReadingQuality::Unresolved);
    assert_eq!(sample.status, Some(DeviceStatus::Acquiring));
}

#[tokio::test]
async fn test_device_failure_does_not_stop_polling() {
    let table = CalibrationTable::from_reader(TABLE.as_bytes(), 0.5).unwrap();
    let adapter = MockAdapter::with_status(DeviceStatus::Idle);
    adapter.set_reply(bragg_daq::instrument::protocol::Command::Peaks(0), "1530.0,1545.0");

    let pipeline = AcquisitionPipeline::new(
        Box::new(BraggMeter::new("mock", adapter.clone())),
        SensorRegistry::new(table, 2.5),
        TrendSegmenter::new(TrendConfig::default()),
        vec![0],
        AcquisitionMode::Peaks,
    )
    .unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let poller = Poller::spawn(pipeline, Duration::from_millis(5), tx);

    let first = rx.recv().await.unwrap();
    assert!(matches!(first, CycleEvent::Sample(_)));

    // Peak read, restart status query and re-read all fail.
    adapter.inject_next_failure();
    adapter.inject_next_failure();
    let mut saw_failure = false;
    let mut recovered = false;
    while !recovered {
        match rx.recv().await.unwrap() {
            CycleEvent::Failed(_) => saw_failure = true,
            CycleEvent::Sample(_) if saw_failure => recovered = true,
            _ => {}
        }
    }
    poller.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_acquisition_resumes_after_warmup() {
    use bragg_daq::instrument::protocol::Command;

    let table = CalibrationTable::from_reader(TABLE.as_bytes(), 0.5).unwrap();
    let adapter = MockAdapter::with_status(DeviceStatus::Warming);
    adapter.set_reply(Command::Peaks(0), "1530.0,1545.0");

    let mut pipeline = AcquisitionPipeline::new(
        Box::new(BraggMeter::new("mock", adapter.clone())),
        SensorRegistry::new(table, 2.5),
        TrendSegmenter::new(TrendConfig::default()),
        vec![0],
        AcquisitionMode::Peaks,
    )
    .unwrap();
    assert!(pipeline.start_device().await.is_err());

    let CycleEvent::Failed(failure) = pipeline.run_cycle().await else {
        panic!("expected the cycle to fail while warming");
    };
    assert!(failure.error.to_string().contains("Warming"));
    assert_eq!(adapter.count(Command::Peaks(0)), 0);

    adapter.set_status(DeviceStatus::Idle);
    for _ in 0..5 {
        let event = pipeline.run_cycle().await;
        assert!(matches!(event, CycleEvent::Sample(_)), "{event:?}");
    }
    assert_eq!(adapter.count(Command::Start), 1);
    assert_eq!(adapter.count(Command::Peaks(0)), 5);
}
