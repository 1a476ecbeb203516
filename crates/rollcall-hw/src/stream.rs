//! Network stream capture (RTSP, HTTP MJPEG) through OpenCV's videoio backend.

use crate::source::{FrameSource, SourceError};
use image::RgbImage;
use opencv::core::{self, Mat, Vector};
use opencv::prelude::*;
use opencv::videoio;
use thiserror::Error;

/// Connect and per-read timeout handed to the videoio backend.
const IO_TIMEOUT_MS: i32 = 5_000;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("could not open stream {0}")]
    OpenFailed(String),
    #[error("unexpected frame layout: {0}")]
    BadFrame(String),
    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// An open network stream.
pub struct NetworkStream {
    capture: videoio::VideoCapture,
    /// Redacted URL for logs.
    name: String,
}

impl NetworkStream {
    pub fn open(url: &str) -> Result<Self, StreamError> {
        let name = crate::source::SourceDescriptor::Network(url.to_string()).to_string();
        let params = Vector::<i32>::from_slice(&[
            videoio::CAP_PROP_OPEN_TIMEOUT_MSEC,
            IO_TIMEOUT_MS,
            videoio::CAP_PROP_READ_TIMEOUT_MSEC,
            IO_TIMEOUT_MS,
        ]);
        let mut capture =
            videoio::VideoCapture::from_file_with_params(url, videoio::CAP_ANY, &params)?;
        if !capture.is_opened()? {
            return Err(StreamError::OpenFailed(name));
        }
        // Keep only the newest decoded frame buffered.
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;
        tracing::info!(stream = %name, "opened network stream");
        Ok(Self { capture, name })
    }

    fn grab(&mut self) -> Result<Option<RgbImage>, StreamError> {
        let mut mat = Mat::default();
        if !self.capture.read(&mut mat)? || mat.empty() {
            return Ok(None);
        }
        bgr_mat_to_rgb(&mat).map(Some)
    }
}

fn bgr_mat_to_rgb(mat: &Mat) -> Result<RgbImage, StreamError> {
    if mat.typ() != core::CV_8UC3 {
        return Err(StreamError::BadFrame(format!("mat type {} is not CV_8UC3", mat.typ())));
    }
    let owned;
    let mat = if mat.is_continuous() {
        mat
    } else {
        owned = mat.try_clone()?;
        &owned
    };
    let (width, height) = (mat.cols() as u32, mat.rows() as u32);
    let rgb: Vec<u8> = mat
        .data_bytes()?
        .chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| StreamError::BadFrame(format!("{width}x{height} buffer size mismatch")))
}

impl FrameSource for NetworkStream {
    fn describe(&self) -> String {
        self.name.clone()
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        self.grab().map_err(SourceError::from)
    }
}
