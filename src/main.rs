//! BraggMeter acquisition daemon.
//!
//! ```text
//! bragg_daq --config config/default.toml            # poll until Ctrl-C
//! bragg_daq --simulate --cycles 120                 # no hardware, stop after 120 cycles
//! bragg_daq --once                                  # one measurement as JSON
//! bragg_daq --print-config                          # effective settings as TOML
//! ```

use anyhow::{Context, Result};
use bragg_daq::config::{DeviceBackendKind, Settings};
use bragg_daq::core::{CycleEvent, Sample};
use bragg_daq::data::export::{ExportResult, ExportWorker};
use bragg_daq::data::storage::CsvSampleWriter;
use bragg_daq::instrument::wait_until_ready;
use bragg_daq::poller::{AcquisitionPipeline, Poller};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Acquisition and trend tracking for BraggMeter interrogators
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Use the simulated interrogator instead of the configured backend
    #[arg(long)]
    simulate: bool,

    /// Take a single measurement, print it as JSON and exit
    #[arg(long)]
    once: bool,

    /// Stop after this many cycles
    #[arg(long)]
    cycles: Option<u64>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load_from(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    if args.simulate {
        settings.device.backend = DeviceBackendKind::Simulated;
    }
    if args.print_config {
        print!("{}", settings.to_toml()?);
        return Ok(());
    }

    init_tracing(&settings.application.log_level, args.json_logs);
    info!(
        "{} starting with {:?} backend",
        settings.application.name, settings.device.backend
    );

    let mut pipeline = AcquisitionPipeline::from_settings(&settings)?;
    wait_until_ready(
        pipeline.backend_mut(),
        settings.device.warmup_poll,
        settings.device.warmup_timeout,
    )
    .await?;

    if args.once {
        pipeline.start_device().await?;
        let result = pipeline.measure_once().await;
        if let Err(e) = pipeline.stop_device().await {
            warn!(error = %e, "Could not stop acquisition");
        }
        println!("{}", serde_json::to_string_pretty(&result?)?);
        return Ok(());
    }

    acquire(&settings, pipeline, args.cycles).await
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Polls until Ctrl-C or `max_cycles`, exporting samples in batches.
async fn acquire(
    settings: &Settings,
    pipeline: AcquisitionPipeline,
    max_cycles: Option<u64>,
) -> Result<()> {
    let (event_tx, mut events) = mpsc::channel(settings.acquisition.channel_capacity);
    let poller = Poller::spawn(pipeline, settings.acquisition.interval, event_tx);

    let (worker, mut export_results) = ExportWorker::new(Arc::new(CsvSampleWriter::new()));
    let mut target = settings.storage.target();
    let flush_every = settings.storage.flush_every;
    let mut pending: Vec<Sample> = Vec::with_capacity(flush_every);
    let mut seen = 0u64;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("Poller stopped unexpectedly");
                    break;
                };
                seen += 1;
                handle_event(event, &mut pending);
                if pending.len() >= flush_every {
                    worker.submit(std::mem::take(&mut pending), target.clone())?;
                }
                if max_cycles.is_some_and(|n| seen >= n) {
                    info!(cycles = seen, "Cycle limit reached");
                    break;
                }
            }
            Some(result) = export_results.recv() => report_export(result, &mut target),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    poller.shutdown().await?;
    while let Ok(event) = events.try_recv() {
        handle_event(event, &mut pending);
    }
    if !pending.is_empty() {
        worker.submit(std::mem::take(&mut pending), target.clone())?;
    }
    worker.finish().await;
    while let Some(result) = export_results.recv().await {
        report_export(result, &mut target);
    }
    Ok(())
}

fn handle_event(event: CycleEvent, pending: &mut Vec<Sample>) {
    match event {
        CycleEvent::Sample(sample) => {
            info!(
                cycle = sample.cycle,
                resolved = sample.resolved_count(),
                sensors = sample.sensors.len(),
                temperature = ?sample.reference_temperature,
                "Sample"
            );
            for event in &sample.segments_closed {
                info!(
                    sensor = %event.sensor,
                    slope = event.segment.fit.slope,
                    points = event.segment.end - event.segment.start,
                    "Trend segment closed"
                );
            }
            pending.push(sample);
        }
        CycleEvent::Spectrum(frame) => {
            info!(
                cycle = frame.cycle,
                channels = frame.traces.len(),
                points = frame.traces.first().map_or(0, |t| t.points.len()),
                "Spectrum"
            );
        }
        // Already logged by the poller.
        CycleEvent::Failed(_) => {}
    }
}

fn report_export(result: ExportResult, target: &mut PathBuf) {
    match result {
        ExportResult::Written { .. } => {}
        ExportResult::Fallback {
            requested, written, ..
        } => {
            warn!(
                requested = %requested.display(),
                written = %written.display(),
                "Export target unavailable, continuing in fallback file"
            );
            *target = written;
        }
        ExportResult::Failed(e) => error!(error = %e, "Sample batch lost"),
    }
}
