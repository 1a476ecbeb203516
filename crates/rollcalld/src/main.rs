use anyhow::{bail, Context, Result};
use clap::Parser;
use rollcall_core::{AttendanceLedger, Config, EuclideanMatcher, GalleryStore, OnnxEngine};
use rollcall_hw::{stop_signal, DescriptorOpener, SourceDescriptor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod display;
mod pipeline;
mod scheduler;

use display::SnapshotDisplay;
use pipeline::{Pipeline, PipelineStats, RetryPolicy};
use scheduler::{Identifier, Scheduler};

#[derive(Parser)]
#[command(name = "rollcalld", about = "Face-recognition attendance daemon", version)]
struct Args {
    /// TOML configuration file (overrides ROLLCALL_CONFIG)
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let (pipeline, heartbeat_every) = match init(args.config) {
        Ok(ready) => ready,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "startup failed");
            return Err(e);
        }
    };

    let (trigger, signal) = stop_signal();
    let heartbeat = tokio::spawn(heartbeat(pipeline.stats(), heartbeat_every));
    let mut run = tokio::task::spawn_blocking(move || pipeline.run(signal));

    tracing::info!("rollcalld ready");

    let joined = tokio::select! {
        joined = &mut run => {
            tracing::warn!("pipeline exited without a stop request");
            joined
        }
        () = shutdown_signal() => {
            tracing::info!("rollcalld shutting down");
            trigger.trigger();
            (&mut run).await
        }
    };
    heartbeat.abort();

    let report = joined.context("pipeline task failed")??;
    let s = report.stats;
    tracing::info!(
        frames = s.frames,
        frames_dropped = s.frames_dropped,
        samples = s.samples,
        samples_discarded = s.samples_discarded,
        reconnects = s.reconnects,
        marks = s.marks,
        ledger_failures = s.ledger_failures,
        "rollcalld stopped"
    );
    if !report.ledger_flushed {
        bail!("attendance ledger was not flushed cleanly");
    }
    Ok(())
}

/// Load configuration, gallery, engine and ledger. Any error here is fatal.
fn init(config_path: Option<PathBuf>) -> Result<(Pipeline, Duration)> {
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let descriptor = SourceDescriptor::parse(&config.source_descriptor)
        .context("invalid source_descriptor")?;
    descriptor
        .ensure_supported()
        .context("rebuild rollcalld with --features stream")?;

    let store = GalleryStore::open_existing(&config.gallery_path)
        .with_context(|| format!("cannot open gallery {}", config.gallery_path.display()))?;
    let gallery = store.load().context("cannot load gallery")?;
    if gallery.is_empty() {
        tracing::warn!(
            path = %config.gallery_path.display(),
            "gallery is empty, every face will be reported as unknown"
        );
    }
    tracing::info!(
        path = %config.gallery_path.display(),
        identities = gallery.identities().len(),
        samples = gallery.len(),
        dim = ?gallery.dimension(),
        "gallery loaded"
    );

    let engine = OnnxEngine::load(
        &config.detector_model_path(),
        &config.embedder_model_path(),
        config.detection_confidence,
    )
    .context("cannot load recognition models")?;

    let ledger = AttendanceLedger::open(&config.records_directory).with_context(|| {
        format!(
            "cannot open attendance ledger in {}",
            config.records_directory.display()
        )
    })?;
    tracing::info!(
        path = %ledger.active_path().display(),
        already_marked = ledger.marked_count(),
        "attendance ledger opened"
    );

    let backoff = config
        .reconnect_backoff()
        .unwrap_or_else(|| descriptor.default_backoff());
    tracing::info!(
        source = %descriptor,
        sample_stride = config.sample_stride,
        downscale_factor = config.downscale_factor,
        match_threshold = config.match_threshold,
        backoff_secs = backoff.as_secs_f32(),
        "pipeline configured"
    );

    let identifier = Identifier::new(
        Box::new(EuclideanMatcher),
        Arc::new(gallery),
        config.match_threshold,
    );
    let mut pipeline = Pipeline::new(
        Box::new(DescriptorOpener::new(descriptor)),
        backoff,
        Scheduler::new(config.sample_stride, config.downscale_factor),
        Box::new(engine),
        identifier,
        ledger,
    )
    .with_retry(RetryPolicy {
        attempts: config.ledger_retry_attempts,
        backoff: config.ledger_retry_backoff(),
    });

    if let Some(path) = &config.snapshot_path {
        let display = SnapshotDisplay::new(path, config.snapshot_interval())
            .with_context(|| format!("cannot prepare snapshot path {}", path.display()))?;
        tracing::info!(path = %path.display(), "writing annotated snapshots");
        pipeline = pipeline.with_display(Box::new(display));
    }

    Ok((pipeline, config.heartbeat_interval()))
}

async fn heartbeat(stats: Arc<PipelineStats>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let s = stats.snapshot();
        tracing::info!(
            frames = s.frames,
            frames_dropped = s.frames_dropped,
            samples = s.samples,
            samples_discarded = s.samples_discarded,
            reconnects = s.reconnects,
            marks = s.marks,
            mark_requests_dropped = s.mark_requests_dropped,
            ledger_failures = s.ledger_failures,
            "heartbeat"
        );
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "SIGINT handler failed");
                    }
                }
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler, waiting for SIGINT only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "SIGINT handler failed");
            }
        }
    }
}
