//! Periodic acquisition.
//!
//! The [`AcquisitionPipeline`] runs one cycle: read peaks (or traces) from the
//! device, match peaks to sensors, convert, update trends. The [`Poller`]
//! owns a pipeline on its own task and runs a cycle per tick:
//!
//! ```text
//! PollerHandle --[PollerCommand]--> poller task --[CycleEvent]--> consumer
//!                                        |
//!                                 AcquisitionPipeline --> DeviceBackend
//! ```
//!
//! Cycles never overlap. A cycle that outlasts the period makes the poller
//! skip the missed ticks instead of bursting to catch up. A failed cycle is
//! published as [`CycleEvent::Failed`] and polling continues on the next tick.

use crate::config::{validate_channels, AcquisitionMode, Settings};
use crate::core::{
    ChannelTrace, CycleEvent, CycleFailure, RawPeak, Sample, SegmentEvent, SpectrumFrame,
};
use crate::data::trend::TrendSegmenter;
use crate::error::{AppResult, DaqError};
use crate::instrument::{self, DeviceBackend};
use crate::sensor::{calibration, CalibrationTable, SensorRegistry};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// One acquisition cycle, end to end.
pub struct AcquisitionPipeline {
    backend: Box<dyn DeviceBackend>,
    registry: SensorRegistry,
    trend: TrendSegmenter,
    channels: Vec<u8>,
    mode: AcquisitionMode,
    origin: Option<Instant>,
    cycle: u64,
}

impl AcquisitionPipeline {
    /// Assembles a pipeline; `channels` must be valid device channels.
    pub fn new(
        backend: Box<dyn DeviceBackend>,
        registry: SensorRegistry,
        trend: TrendSegmenter,
        channels: Vec<u8>,
        mode: AcquisitionMode,
    ) -> AppResult<Self> {
        validate_channels(&channels)?;
        Ok(Self {
            backend,
            registry,
            trend,
            channels,
            mode,
            origin: None,
            cycle: 0,
        })
    }

    /// Loads the calibration table and builds the configured backend.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let table = CalibrationTable::load(
            &settings.calibration.table,
            settings.calibration.min_separation_nm,
        )?;
        let backend = instrument::from_settings(settings, &table);
        Self::new(
            backend,
            SensorRegistry::new(table, settings.calibration.tolerance_nm),
            TrendSegmenter::new(settings.trend.clone()),
            settings.acquisition.channels.clone(),
            settings.acquisition.mode,
        )
    }

    /// The device.
    pub fn backend_mut(&mut self) -> &mut dyn DeviceBackend {
        self.backend.as_mut()
    }

    /// Sensors with their state from the last cycle.
    pub fn registry(&self) -> &SensorRegistry {
        &self.registry
    }

    /// Trend of every sensor.
    pub fn trend(&self) -> &TrendSegmenter {
        &self.trend
    }

    /// Channels read each cycle.
    pub fn channels(&self) -> &[u8] {
        &self.channels
    }

    /// Replaces the channel list.
    pub fn set_channels(&mut self, channels: Vec<u8>) -> AppResult<()> {
        validate_channels(&channels)?;
        info!(?channels, "Acquisition channels reconfigured");
        self.channels = channels;
        Ok(())
    }

    /// Cycles attempted so far.
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Puts the device into acquisition.
    pub async fn start_device(&mut self) -> AppResult<()> {
        self.backend.start().await
    }

    /// Stops acquisition on the device.
    pub async fn stop_device(&mut self) -> AppResult<()> {
        self.backend.stop().await
    }

    /// Runs one cycle in the configured mode. Never fails; failures become events.
    pub async fn run_cycle(&mut self) -> CycleEvent {
        self.cycle += 1;
        let cycle = self.cycle;
        let timestamp = Utc::now();

        let result = match self.mode {
            AcquisitionMode::Peaks => self
                .acquire_sample(cycle, timestamp)
                .await
                .map(CycleEvent::Sample),
            AcquisitionMode::Spectrum => self
                .acquire_spectrum(cycle, timestamp)
                .await
                .map(CycleEvent::Spectrum),
        };
        result.unwrap_or_else(|error| {
            CycleEvent::Failed(CycleFailure {
                cycle,
                timestamp,
                error,
            })
        })
    }

    /// One peaks cycle, whatever the configured mode.
    pub async fn measure_once(&mut self) -> AppResult<Sample> {
        self.cycle += 1;
        self.acquire_sample(self.cycle, Utc::now()).await
    }

    async fn acquire_sample(
        &mut self,
        cycle: u64,
        timestamp: chrono::DateTime<Utc>,
    ) -> AppResult<Sample> {
        let origin = *self.origin.get_or_insert_with(Instant::now);

        let mut peaks = Vec::new();
        for &channel in &self.channels {
            let wavelengths = self.backend.acquire_peaks(channel).await?;
            peaks.extend(RawPeak::on_channel(channel, &wavelengths));
        }

        let resolved = self.registry.resolve(&peaks);
        let conversion = calibration::convert(self.registry.table_mut());
        let elapsed_s = origin.elapsed().as_secs_f64();

        let mut sensors = conversion.readings;
        let mut segments_closed = Vec::new();
        for reading in &mut sensors {
            let Some(value) = reading.value else {
                continue;
            };
            let update = self.trend.update(&reading.sensor, elapsed_s, value);
            reading.trend = update.fitted;
            if let Some(segment) = update.closed {
                debug!(sensor = %reading.sensor, start = segment.start, end = segment.end, "Trend segment closed");
                segments_closed.push(SegmentEvent {
                    sensor: reading.sensor.clone(),
                    segment,
                });
            }
        }

        debug!(
            cycle,
            peaks = peaks.len(),
            resolved,
            sensors = sensors.len(),
            "Peaks cycle complete"
        );
        Ok(Sample {
            cycle,
            timestamp,
            elapsed_s,
            status: self.backend.last_status(),
            peaks,
            reference_temperature: conversion.reference_temperature,
            sensors,
            segments_closed,
        })
    }

    async fn acquire_spectrum(
        &mut self,
        cycle: u64,
        timestamp: chrono::DateTime<Utc>,
    ) -> AppResult<SpectrumFrame> {
        let mut traces = Vec::with_capacity(self.channels.len());
        for &channel in &self.channels {
            let points = self.backend.acquire_trace(channel).await?;
            traces.push(ChannelTrace { channel, points });
        }
        Ok(SpectrumFrame {
            cycle,
            timestamp,
            traces,
        })
    }
}

/// Requests accepted by the poller task.
#[derive(Debug)]
pub enum PollerCommand {
    /// Stop ticking; the device stays in acquisition.
    Pause {
        /// Acknowledged once paused
        response: oneshot::Sender<()>,
    },
    /// Tick again.
    Resume {
        /// Acknowledged once resumed
        response: oneshot::Sender<()>,
    },
    /// Replace the channel list; only while paused.
    Reconfigure {
        /// New channels
        channels: Vec<u8>,
        /// Outcome
        response: oneshot::Sender<AppResult<()>>,
    },
    /// Run one peaks cycle now, outside the schedule.
    MeasureOnce {
        /// The sample
        response: oneshot::Sender<AppResult<Sample>>,
    },
    /// Finish the current cycle, stop the device and exit.
    Shutdown,
}

/// Spawns poller tasks.
pub struct Poller;

impl Poller {
    /// Starts polling `pipeline` every `period`, publishing to `events`.
    pub fn spawn(
        pipeline: AcquisitionPipeline,
        period: Duration,
        events: mpsc::Sender<CycleEvent>,
    ) -> PollerHandle {
        let (command_tx, command_rx) = mpsc::channel(16);
        let paused = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(
            pipeline,
            period,
            command_rx,
            events,
            Arc::clone(&paused),
        ));
        PollerHandle {
            commands: command_tx,
            paused,
            task,
        }
    }
}

async fn run(
    mut pipeline: AcquisitionPipeline,
    period: Duration,
    mut commands: mpsc::Receiver<PollerCommand>,
    events: mpsc::Sender<CycleEvent>,
    paused: Arc<AtomicBool>,
) -> AcquisitionPipeline {
    info!(backend = %pipeline.backend.name(), ?period, "Poller started");
    if let Err(e) = pipeline.start_device().await {
        warn!(error = %e, "Could not start acquisition; cycles will keep trying");
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut is_paused = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PollerCommand::Pause { response }) => {
                    is_paused = true;
                    paused.store(true, Ordering::SeqCst);
                    info!("Poller paused");
                    let _ = response.send(());
                }
                Some(PollerCommand::Resume { response }) => {
                    if is_paused {
                        ticker.reset();
                    }
                    is_paused = false;
                    paused.store(false, Ordering::SeqCst);
                    info!("Poller resumed");
                    let _ = response.send(());
                }
                Some(PollerCommand::Reconfigure { channels, response }) => {
                    let result = if is_paused {
                        pipeline.set_channels(channels)
                    } else {
                        Err(DaqError::PollerRunning)
                    };
                    let _ = response.send(result);
                }
                Some(PollerCommand::MeasureOnce { response }) => {
                    let _ = response.send(pipeline.measure_once().await);
                }
                Some(PollerCommand::Shutdown) | None => break,
            },
            _ = ticker.tick(), if !is_paused => {
                let started = Instant::now();
                let event = pipeline.run_cycle().await;
                if let CycleEvent::Failed(failure) = &event {
                    warn!(cycle = failure.cycle, error = %failure.error, "Acquisition cycle failed");
                }
                let elapsed = started.elapsed();
                if elapsed > period {
                    debug!(
                        ?elapsed,
                        skipped = elapsed.as_nanos() / period.as_nanos().max(1),
                        "Cycle overran the polling period, skipping ticks"
                    );
                }
                if events.send(event).await.is_err() {
                    info!("Event receiver dropped, stopping poller");
                    break;
                }
            }
        }
    }

    if let Err(e) = pipeline.stop_device().await {
        warn!(error = %e, "Could not stop acquisition on shutdown");
    }
    info!(cycles = pipeline.cycles(), "Poller stopped");
    pipeline
}

/// Control side of a running poller.
pub struct PollerHandle {
    commands: mpsc::Sender<PollerCommand>,
    paused: Arc<AtomicBool>,
    task: JoinHandle<AcquisitionPipeline>,
}

impl PollerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PollerCommand,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| DaqError::PollerStopped)?;
        rx.await.map_err(|_| DaqError::PollerStopped)
    }

    /// Stops ticking after the current cycle.
    pub async fn pause(&self) -> AppResult<()> {
        self.request(|response| PollerCommand::Pause { response })
            .await
    }

    /// Resumes ticking.
    pub async fn resume(&self) -> AppResult<()> {
        self.request(|response| PollerCommand::Resume { response })
            .await
    }

    /// Replaces the channel list; fails with [`DaqError::PollerRunning`] unless paused.
    pub async fn reconfigure(&self, channels: Vec<u8>) -> AppResult<()> {
        self.request(|response| PollerCommand::Reconfigure { channels, response })
            .await?
    }

    /// Runs one peaks cycle outside the schedule.
    pub async fn measure_once(&self) -> AppResult<Sample> {
        self.request(|response| PollerCommand::MeasureOnce { response })
            .await?
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// True once the poller task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the poller and returns its pipeline.
    ///
    /// A cycle in progress completes first; the device is then stopped.
    pub async fn shutdown(self) -> AppResult<AcquisitionPipeline> {
        // Already stopped if the send fails; the join below reports it.
        let _ = self.commands.send(PollerCommand::Shutdown).await;
        self.task.await.map_err(|e| {
            error!(error = %e, "Poller task ended abnormally");
            DaqError::PollerStopped
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrendConfig;
    use crate::instrument::simulated::{SimulatedDevice, SimulatedGrating};
    use crate::sensor::Sensor;
    use tracing_test::traced_test;

    fn pipeline(mode: AcquisitionMode) -> AcquisitionPipeline {
        let table = CalibrationTable::new(
            vec![
                Sensor::temperature("t1", 0, 1530.0, 21.0, 95.0, 0.0),
                Sensor::strain("e1", 0, 1550.0, 0.78, 6.5),
                Sensor::temperature("t2", 1, 1540.0, 21.0, 95.0, 0.0),
            ],
            0.5,
        )
        .unwrap();
        let device = SimulatedDevice::from_table(&table).with_seed(3);
        AcquisitionPipeline::new(
            Box::new(device),
            SensorRegistry::new(table, 2.5),
            TrendSegmenter::new(TrendConfig::default()),
            vec![0],
            mode,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_peaks_cycle_produces_sample() {
        let mut pipeline = pipeline(AcquisitionMode::Peaks);
        pipeline.start_device().await.unwrap();

        let CycleEvent::Sample(sample) = pipeline.run_cycle().await else {
            panic!("expected a sample");
        };
        assert_eq!(sample.cycle, 1);
        assert_eq!(sample.sensors.len(), 3);
        assert!(sample.sensor("t1").unwrap().value.is_some());
        assert!(sample.sensor("e1").unwrap().value.is_some());
        // Channel 1 is not polled.
        assert_eq!(sample.sensor("t2").unwrap().value, None);
        assert!(sample.reference_temperature.is_some());
    }

    #[tokio::test]
    async fn test_spectrum_cycle_produces_frame() {
        let mut pipeline = pipeline(AcquisitionMode::Spectrum);
        pipeline.start_device().await.unwrap();

        let CycleEvent::Spectrum(frame) = pipeline.run_cycle().await else {
            panic!("expected a spectrum");
        };
        assert_eq!(frame.traces.len(), 1);
        assert_eq!(frame.traces[0].channel, 0);
        assert!(!frame.traces[0].points.is_empty());
    }

    #[tokio::test]
    async fn test_failed_cycle_becomes_event() {
        let device = SimulatedDevice::new(vec![SimulatedGrating {
            channel: 0,
            lambda0: 1530.0,
        }])
        .with_warmup(100);
        let table = CalibrationTable::new(vec![], 0.5).unwrap();
        let mut pipeline = AcquisitionPipeline::new(
            Box::new(device),
            SensorRegistry::new(table, 2.5),
            TrendSegmenter::new(TrendConfig::default()),
            vec![0],
            AcquisitionMode::Peaks,
        )
        .unwrap();

        match pipeline.run_cycle().await {
            CycleEvent::Failed(failure) => {
                assert_eq!(failure.cycle, 1);
                assert!(matches!(failure.error, DaqError::DeviceNotReady(_)));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    #[traced_test]
    fn test_rejects_invalid_channels() {
        let mut pipeline = pipeline(AcquisitionMode::Peaks);
        assert!(pipeline.set_channels(vec![]).is_err());
        assert!(pipeline.set_channels(vec![0, 0]).is_err());
        pipeline.set_channels(vec![0, 1]).unwrap();
        assert_eq!(pipeline.channels(), &[0, 1]);
        assert!(logs_contain("Acquisition channels reconfigured"));
    }

    #[tokio::test]
    async fn test_poller_publishes_and_pauses() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Poller::spawn(pipeline(AcquisitionMode::Peaks), Duration::from_millis(5), tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.cycle(), 1);
        assert!(matches!(first, CycleEvent::Sample(_)));

        handle.pause().await.unwrap();
        assert!(handle.is_paused());
        handle.reconfigure(vec![0, 1]).await.unwrap();
        handle.resume().await.unwrap();
        assert!(!handle.is_paused());

        let pipeline = handle.shutdown().await.unwrap();
        assert_eq!(pipeline.channels(), &[0, 1]);
        assert!(pipeline.cycles() >= 1);
    }

    #[tokio::test]
    async fn test_no_cycles_while_paused() {
        let (tx, mut rx) = mpsc::channel(64);
        let handle = Poller::spawn(pipeline(AcquisitionMode::Peaks), Duration::from_millis(5), tx);

        let mut last_cycle = 0;
        while last_cycle < 3 {
            last_cycle = rx.recv().await.unwrap().cycle();
        }
        handle.pause().await.unwrap();
        while let Ok(event) = rx.try_recv() {
            last_cycle = event.cycle();
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err(), "a cycle ran while paused");

        handle.resume().await.unwrap();
        let next = rx.recv().await.unwrap();
        assert_eq!(next.cycle(), last_cycle + 1);

        let pipeline = handle.shutdown().await.unwrap();
        let series = pipeline.trend().series("t1").unwrap();
        assert_eq!(series.len() as u64, pipeline.cycles());
        assert!(series.len() as u64 > last_cycle);
    }

    /// Simulated device whose first few peak reads are slow.
    struct SlowDevice {
        inner: SimulatedDevice,
        slow_reads: usize,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl DeviceBackend for SlowDevice {
        fn name(&self) -> String {
            "slow simulated BraggMeter".to_string()
        }

        fn last_status(&self) -> Option<crate::instrument::DeviceStatus> {
            self.inner.last_status()
        }

        async fn status(&mut self) -> AppResult<crate::instrument::DeviceStatus> {
            self.inner.status().await
        }

        async fn start(&mut self) -> AppResult<()> {
            self.inner.start().await
        }

        async fn stop(&mut self) -> AppResult<()> {
            self.inner.stop().await
        }

        async fn acquire_peaks(&mut self, channel: u8) -> AppResult<Vec<f64>> {
            if self.slow_reads > 0 {
                self.slow_reads -= 1;
                tokio::time::sleep(self.delay).await;
            }
            self.inner.acquire_peaks(channel).await
        }

        async fn acquire_trace(&mut self, channel: u8) -> AppResult<Vec<(f64, f64)>> {
            self.inner.acquire_trace(channel).await
        }
    }

    #[tokio::test]
    async fn test_overrun_skips_missed_ticks() {
        let period = Duration::from_millis(20);
        let table = CalibrationTable::new(
            vec![Sensor::temperature("t1", 0, 1530.0, 21.0, 95.0, 0.0)],
            0.5,
        )
        .unwrap();
        let device = SlowDevice {
            inner: SimulatedDevice::from_table(&table).with_seed(5),
            slow_reads: 3,
            delay: Duration::from_millis(100),
        };
        let pipeline = AcquisitionPipeline::new(
            Box::new(device),
            SensorRegistry::new(table, 2.5),
            TrendSegmenter::new(TrendConfig::default()),
            vec![0],
            AcquisitionMode::Peaks,
        )
        .unwrap();

        let started = Instant::now();
        let (tx, mut rx) = mpsc::channel(64);
        let handle = Poller::spawn(pipeline, period, tx);

        let mut arrivals = Vec::new();
        while arrivals.len() < 8 {
            let event = rx.recv().await.unwrap();
            assert!(matches!(event, CycleEvent::Sample(_)));
            arrivals.push(Instant::now());
        }
        let pipeline = handle.shutdown().await.unwrap();
        let elapsed = started.elapsed();

        // Ticks missed during the slow reads are not replayed back to back.
        let after_overrun = arrivals[7].duration_since(arrivals[3]);
        assert!(
            after_overrun >= Duration::from_millis(50),
            "cycles 4-8 ran within {:?}",
            after_overrun
        );
        let max_cycles = (elapsed.as_millis() / period.as_millis()) as u64 + 1;
        assert!(pipeline.cycles() <= max_cycles);
    }

    #[tokio::test]
    async fn test_reconfigure_requires_pause() {
        let (tx, _rx) = mpsc::channel(64);
        let handle = Poller::spawn(pipeline(AcquisitionMode::Peaks), Duration::from_secs(60), tx);
        assert!(matches!(
            handle.reconfigure(vec![1]).await,
            Err(DaqError::PollerRunning)
        ));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_measure_once_while_paused() {
        let (tx, _rx) = mpsc::channel(64);
        let handle = Poller::spawn(pipeline(AcquisitionMode::Spectrum), Duration::from_secs(60), tx);
        handle.pause().await.unwrap();
        let sample = handle.measure_once().await.unwrap();
        assert_eq!(sample.sensors.len(), 3);
        handle.shutdown().await.unwrap();
    }
}
