//! Frame sources and the unbounded reconnect loop.
//!
//! A [`SourceOpener`] knows how to (re)open a device or stream; the
//! [`ReconnectingSource`] wraps it, numbers frames, and turns every transport
//! failure or end-of-stream into close → backoff → reopen. It only gives up
//! when the stop signal fires.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;
use crate::stop::StopSignal;
use image::RgbImage;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

const NETWORK_BACKOFF: Duration = Duration::from_secs(5);
const DEVICE_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[cfg(feature = "stream")]
    #[error("stream: {0}")]
    Stream(#[from] crate::stream::StreamError),
    #[error("invalid source descriptor: {0:?}")]
    InvalidDescriptor(String),
    #[error("network stream {0} requires a build with the `stream` feature")]
    Unsupported(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Where frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// Local V4L2 device path.
    Device(String),
    /// RTSP/HTTP URL handled by the network backend.
    Network(String),
}

impl SourceDescriptor {
    /// Parse an operator-supplied descriptor.
    ///
    /// A bare integer `N` is a camera index (`/dev/videoN`), a `/dev/` path is
    /// a device, and anything with a URL scheme is a network stream.
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let raw = raw.trim();
        if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Self::Device(format!("/dev/video{raw}")));
        }
        if raw.starts_with("/dev/") {
            return Ok(Self::Device(raw.to_string()));
        }
        if raw.contains("://") {
            return Ok(Self::Network(raw.to_string()));
        }
        Err(SourceError::InvalidDescriptor(raw.to_string()))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Fails for network streams when this build lacks the `stream` feature.
    pub fn ensure_supported(&self) -> Result<(), SourceError> {
        if self.is_network() && !cfg!(feature = "stream") {
            return Err(SourceError::Unsupported(self.to_string()));
        }
        Ok(())
    }

    /// Reconnect backoff used when the operator does not configure one.
    pub fn default_backoff(&self) -> Duration {
        match self {
            Self::Device(_) => DEVICE_BACKOFF,
            Self::Network(_) => NETWORK_BACKOFF,
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(path) => f.write_str(path),
            // Never print stream credentials.
            Self::Network(url) => f.write_str(&redact_credentials(url)),
        }
    }
}

fn redact_credentials(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://***@{}", &rest[at + 1..]),
        None => url.to_string(),
    }
}

/// An open device or stream handle. Dropping it releases the underlying resource.
pub trait FrameSource {
    /// Human-readable name for logs.
    fn describe(&self) -> String;

    /// Next raw frame, `Ok(None)` at end-of-stream.
    ///
    /// Must return within a bounded time: a stalled transport is reported as
    /// an error, otherwise the reconnect loop never runs and stop is never seen.
    fn read(&mut self) -> Result<Option<RgbImage>, SourceError>;
}

/// Opens (and reopens) a [`FrameSource`].
pub trait SourceOpener: Send {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Opener for a parsed [`SourceDescriptor`].
pub struct DescriptorOpener {
    descriptor: SourceDescriptor,
}

impl DescriptorOpener {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        Self { descriptor }
    }
}

impl SourceOpener for DescriptorOpener {
    fn open(&mut self) -> Result<Box<dyn FrameSource>, SourceError> {
        match &self.descriptor {
            SourceDescriptor::Device(path) => Ok(Box::new(Camera::open(path)?)),
            #[cfg(feature = "stream")]
            SourceDescriptor::Network(url) => {
                Ok(Box::new(crate::stream::NetworkStream::open(url)?))
            }
            #[cfg(not(feature = "stream"))]
            SourceDescriptor::Network(_) => {
                Err(SourceError::Unsupported(self.descriptor.to_string()))
            }
        }
    }
}

/// Frame source that survives transport failures.
///
/// Must be driven from a single thread; the open handle is not assumed to be `Send`.
/// Stop is checked between reads, so it is only as prompt as [`FrameSource::read`] is bounded.
pub struct ReconnectingSource {
    opener: Box<dyn SourceOpener>,
    current: Option<Box<dyn FrameSource>>,
    backoff: Duration,
    stop: StopSignal,
    next_sequence: u64,
    reconnects: u64,
}

impl ReconnectingSource {
    pub fn new(opener: Box<dyn SourceOpener>, backoff: Duration, stop: StopSignal) -> Self {
        Self {
            opener,
            current: None,
            backoff,
            stop,
            next_sequence: 0,
            reconnects: 0,
        }
    }

    /// Number of reconnect attempts so far.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Block until the next frame is available, reconnecting as often as needed.
    ///
    /// Returns `None` only when the stop signal fires; the open handle is
    /// released before returning.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if self.stop.is_stopped() {
                self.release();
                return None;
            }

            if self.current.is_none() {
                match self.opener.open() {
                    Ok(source) => {
                        tracing::info!(
                            source = %source.describe(),
                            reconnects = self.reconnects,
                            "frame source opened"
                        );
                        self.current = Some(source);
                    }
                    Err(err) => {
                        if !self.back_off(&err) {
                            return None;
                        }
                        continue;
                    }
                }
            }
            let Some(source) = self.current.as_mut() else {
                continue;
            };

            match source.read() {
                Ok(Some(image)) => {
                    let sequence = self.next_sequence;
                    self.next_sequence += 1;
                    return Some(Frame {
                        image,
                        sequence,
                        captured_at: Instant::now(),
                    });
                }
                Ok(None) => {
                    let err = SourceError::Unavailable(format!(
                        "{} reached end of stream",
                        source.describe()
                    ));
                    self.release();
                    if !self.back_off(&err) {
                        return None;
                    }
                }
                Err(err) => {
                    self.release();
                    if !self.back_off(&err) {
                        return None;
                    }
                }
            }
        }
    }

    /// Log one reconnect attempt and wait out the backoff. `false` if stopped meanwhile.
    fn back_off(&mut self, err: &SourceError) -> bool {
        self.reconnects += 1;
        tracing::warn!(
            attempt = self.reconnects,
            error = %err,
            backoff_secs = self.backoff.as_secs_f32(),
            "frame source unavailable, reconnecting"
        );
        !self.stop.wait(self.backoff)
    }

    fn release(&mut self) {
        if let Some(source) = self.current.take() {
            tracing::info!(source = %source.describe(), "releasing frame source");
        }
    }
}

impl Drop for ReconnectingSource {
    fn drop(&mut self) {
        self.release();
    }
}
