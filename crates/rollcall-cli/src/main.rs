use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::ledger::{partition_path, read_partition};
use rollcall_core::{Config, GalleryEntry, GalleryStore, OnnxEngine, RecognitionEngine};
use rollcall_hw::{Camera, SourceDescriptor};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance tooling", version)]
struct Cli {
    /// TOML configuration file (overrides ROLLCALL_CONFIG)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered identities
    Gallery {
        #[command(subcommand)]
        command: GalleryCommand,
    },
    /// Print one day's attendance records
    Attendance {
        /// Day to show (YYYY-MM-DD), default today
        #[arg(short, long)]
        date: Option<String>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List V4L2 capture devices
    Devices,
    /// Validate and print the effective configuration
    CheckConfig,
}

#[derive(Subcommand)]
enum GalleryCommand {
    /// Register face samples for an identity from still images
    Enroll {
        /// Identity id, e.g. a roll number (stored upper-case)
        #[arg(long)]
        id: String,
        /// Display name shown on the overlay and in the ledger
        #[arg(long)]
        name: String,
        /// Image files, one face sample each
        #[arg(long = "image", required = true)]
        images: Vec<PathBuf>,
    },
    /// List registered identities
    List {
        #[arg(long)]
        json: bool,
    },
    /// Remove every sample of an identity
    Remove {
        /// Identity id (case-insensitive)
        id: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(file = ?cli.config, records = %config.records_directory.display(), "configuration loaded");

    match cli.command {
        Commands::Gallery { command } => match command {
            GalleryCommand::Enroll { id, name, images } => enroll(&config, &id, &name, &images)?,
            GalleryCommand::List { json } => list_gallery(&config, json)?,
            GalleryCommand::Remove { id } => remove_identity(&config, &id)?,
        },
        Commands::Attendance { date, json } => show_attendance(&config, date.as_deref(), json)?,
        Commands::Devices => list_devices(),
        Commands::CheckConfig => check_config(&config)?,
    }

    Ok(())
}

fn enroll(config: &Config, id: &str, name: &str, images: &[PathBuf]) -> Result<()> {
    config.validate().context("invalid configuration")?;
    if id.trim().is_empty() || name.trim().is_empty() {
        bail!("--id and --name must not be empty");
    }

    let mut engine = OnnxEngine::load(
        &config.detector_model_path(),
        &config.embedder_model_path(),
        config.detection_confidence,
    )
    .context("cannot load recognition models")?;

    // Embed every image before touching the store so a bad photo adds nothing.
    let mut entries = Vec::with_capacity(images.len());
    for path in images {
        tracing::debug!(path = %path.display(), "embedding enrollment image");
        let image = image::open(path)
            .with_context(|| format!("cannot read image {}", path.display()))?
            .to_rgb8();
        let Some(face) = engine
            .detect_largest(&image)
            .with_context(|| format!("recognition failed on {}", path.display()))?
        else {
            bail!("no face found in {}", path.display());
        };
        println!(
            "{}: face at ({:.0}, {:.0}) {:.0}x{:.0}, confidence {:.2}",
            path.display(),
            face.bbox.x,
            face.bbox.y,
            face.bbox.width,
            face.bbox.height,
            face.confidence
        );
        entries.push(GalleryEntry {
            identity_id: id.to_string(),
            display_name: name.to_string(),
            embedding: face.embedding,
        });
    }

    let store = GalleryStore::open(&config.gallery_path)
        .with_context(|| format!("cannot open gallery {}", config.gallery_path.display()))?;
    for entry in &entries {
        store.add(entry).context("cannot store face sample")?;
    }
    println!(
        "Enrolled {} sample(s) for {} ({}) in {}",
        entries.len(),
        id.trim().to_uppercase(),
        name.trim(),
        config.gallery_path.display()
    );
    Ok(())
}

fn list_gallery(config: &Config, json: bool) -> Result<()> {
    let store = GalleryStore::open_existing(&config.gallery_path)
        .with_context(|| format!("cannot open gallery {}", config.gallery_path.display()))?;
    let identities = store.list()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&identities)?);
        return Ok(());
    }
    if identities.is_empty() {
        println!("No identities registered");
        return Ok(());
    }
    println!("{:<16} {:<32} {:>7}", "ID", "NAME", "SAMPLES");
    for identity in identities {
        println!(
            "{:<16} {:<32} {:>7}",
            identity.identity_id, identity.display_name, identity.samples
        );
    }
    Ok(())
}

fn remove_identity(config: &Config, id: &str) -> Result<()> {
    let store = GalleryStore::open_existing(&config.gallery_path)
        .with_context(|| format!("cannot open gallery {}", config.gallery_path.display()))?;
    let removed = store.remove(id)?;
    if removed == 0 {
        bail!("no identity {} in {}", id.trim().to_uppercase(), config.gallery_path.display());
    }
    println!("Removed {removed} sample(s) for {}", id.trim().to_uppercase());
    Ok(())
}

fn show_attendance(config: &Config, date: Option<&str>, json: bool) -> Result<()> {
    let date = match date {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .with_context(|| format!("invalid date {raw:?}, expected YYYY-MM-DD"))?,
        None => Local::now().date_naive(),
    };
    let records = read_partition(&config.records_directory, date)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    println!(
        "{} ({} present)",
        partition_path(&config.records_directory, date).display(),
        records.len()
    );
    for record in records {
        println!(
            "{:<16} {:<32} {}",
            record.identity_id,
            record.display_name,
            record.timestamp.format("%H:%M:%S")
        );
    }
    Ok(())
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
}

fn check_config(config: &Config) -> Result<()> {
    config.validate().context("invalid configuration")?;
    let descriptor = SourceDescriptor::parse(&config.source_descriptor)
        .context("invalid source_descriptor")?;
    descriptor
        .ensure_supported()
        .context("rebuild with --features stream")?;

    let mut shown = config.clone();
    shown.source_descriptor = descriptor.to_string();
    print!("{}", toml::to_string_pretty(&shown)?);
    println!();

    let backoff = config
        .reconnect_backoff()
        .unwrap_or_else(|| descriptor.default_backoff());
    println!("# source: {descriptor} (reconnect every {:.1}s)", backoff.as_secs_f32());
    report_path("gallery", &config.gallery_path);
    report_path("detector model", Path::new(&config.detector_model_path()));
    report_path("embedder model", Path::new(&config.embedder_model_path()));
    Ok(())
}

fn report_path(what: &str, path: &Path) {
    let state = if path.exists() {
        "ok"
    } else {
        tracing::warn!(path = %path.display(), "{what} is missing");
        "MISSING"
    };
    println!("# {what}: {} [{state}]", path.display());
}
