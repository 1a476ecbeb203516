//! rollcall-hw: frame acquisition for the attendance pipeline.
//!
//! Provides V4L2 camera capture, optional network stream capture, and the
//! reconnecting frame source that keeps an unattended kiosk running through
//! transport failures.

pub mod camera;
pub mod frame;
pub mod source;
pub mod stop;
#[cfg(feature = "stream")]
pub mod stream;

pub use camera::{Camera, CameraError, PixelFormat};
pub use frame::Frame;
pub use source::{
    DescriptorOpener, FrameSource, ReconnectingSource, SourceDescriptor, SourceError,
    SourceOpener,
};
pub use stop::{stop_signal, StopSignal, StopTrigger};
