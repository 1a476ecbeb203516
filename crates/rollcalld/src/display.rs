//! Where annotated frames go.

use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("image encode: {0}")]
    Image(#[from] image::ImageError),
}

/// Consumer of annotated frames.
pub trait DisplaySink: Send {
    /// Whether the next frame should be composited at all.
    fn wants_frames(&mut self) -> bool;

    fn show(&mut self, frame: &RgbImage) -> Result<(), DisplayError>;
}

/// Headless deployment: nothing is drawn.
pub struct NullDisplay;

impl DisplaySink for NullDisplay {
    fn wants_frames(&mut self) -> bool {
        false
    }

    fn show(&mut self, _frame: &RgbImage) -> Result<(), DisplayError> {
        Ok(())
    }
}

/// Keeps the latest annotated frame on disk as a PNG, at most once per interval.
///
/// Writes go to a sibling temp file and are renamed into place, so readers
/// never see a half-written image.
pub struct SnapshotDisplay {
    path: PathBuf,
    tmp_path: PathBuf,
    interval: Duration,
    last_written: Option<Instant>,
}

impl SnapshotDisplay {
    pub fn new(path: &Path, interval: Duration) -> Result<Self, DisplayError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        Ok(Self {
            path: path.to_path_buf(),
            tmp_path: path.with_file_name(tmp_name),
            interval,
            last_written: None,
        })
    }
}

impl DisplaySink for SnapshotDisplay {
    fn wants_frames(&mut self) -> bool {
        self.last_written
            .map_or(true, |at| at.elapsed() >= self.interval)
    }

    fn show(&mut self, frame: &RgbImage) -> Result<(), DisplayError> {
        frame.save_with_format(&self.tmp_path, ImageFormat::Png)?;
        std::fs::rename(&self.tmp_path, &self.path)?;
        self.last_written = Some(Instant::now());
        Ok(())
    }
}
