//! mirrorface-hw — Capture layer for the recognition loop.
//!
//! Wraps the onboard camera module and USB cameras (V4L2) and network streams
//! (HTTP MJPEG/snapshot, RTSP with the `rtsp-gstreamer` feature) behind a
//! single `FrameSource` that always yields 320×240 RGB frames.

pub mod camera;
pub mod frame;
pub mod network;
#[cfg(feature = "rtsp-gstreamer")]
mod rtsp;
pub mod source;

pub use camera::{Camera, OnboardCamera, PixelFormat, UsbDevice};
pub use frame::{Frame, FrameError, FRAME_HEIGHT, FRAME_WIDTH};
pub use network::NetworkStream;
pub use source::{
    FrameSource, SourceError, SourceGuard, SourceKind, VideoSource, VideoSourceConfig,
};
