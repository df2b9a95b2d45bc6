//! Video source abstraction — one `FrameSource` over three capture backends.

use crate::camera::{OnboardCamera, UsbDevice};
use crate::frame::{Frame, FrameError};
use crate::network::NetworkStream;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default V4L2 node of the onboard camera module.
pub const DEFAULT_ONBOARD_DEVICE: &str = "/dev/video0";
/// Default connect/read timeout for network streams.
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("network stream requires a non-empty URL")]
    MissingUrl,
    #[error("unknown source kind: {0} (expected onboard, network or usb)")]
    UnknownKind(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("not a video capture device: {0}")]
    StreamingNotSupported(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("could not open stream {url}: {reason}")]
    StreamOpen { url: String, reason: String },
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("stream ended")]
    StreamEnded,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
    #[error("source not initialized")]
    NotInitialized,
}

/// Which capture backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Onboard,
    NetworkStream,
    Usb,
}

impl FromStr for SourceKind {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onboard" | "picamera" => Ok(SourceKind::Onboard),
            "network" | "rtsp" => Ok(SourceKind::NetworkStream),
            "usb" => Ok(SourceKind::Usb),
            _ => Err(SourceError::UnknownKind(s.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Onboard => "onboard",
            SourceKind::NetworkStream => "network",
            SourceKind::Usb => "usb",
        })
    }
}

/// Validated, immutable video source configuration.
#[derive(Debug, Clone)]
pub struct VideoSourceConfig {
    kind: SourceKind,
    network_url: Option<String>,
    usb_index: u32,
    onboard_device: String,
    network_timeout: Duration,
}

impl VideoSourceConfig {
    /// Build a configuration, rejecting a network source without a URL.
    pub fn new(
        kind: SourceKind,
        network_url: Option<String>,
        usb_index: u32,
    ) -> Result<Self, SourceError> {
        let network_url = network_url.filter(|url| !url.trim().is_empty());
        if kind == SourceKind::NetworkStream && network_url.is_none() {
            return Err(SourceError::MissingUrl);
        }
        Ok(Self {
            kind,
            network_url,
            usb_index,
            onboard_device: DEFAULT_ONBOARD_DEVICE.to_string(),
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
        })
    }

    pub fn onboard() -> Self {
        Self {
            kind: SourceKind::Onboard,
            network_url: None,
            usb_index: 0,
            onboard_device: DEFAULT_ONBOARD_DEVICE.to_string(),
            network_timeout: DEFAULT_NETWORK_TIMEOUT,
        }
    }

    pub fn network(url: impl Into<String>) -> Result<Self, SourceError> {
        Self::new(SourceKind::NetworkStream, Some(url.into()), 0)
    }

    pub fn usb(index: u32) -> Self {
        Self {
            usb_index: index,
            kind: SourceKind::Usb,
            ..Self::onboard()
        }
    }

    pub fn with_onboard_device(mut self, device: impl Into<String>) -> Self {
        self.onboard_device = device.into();
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn network_url(&self) -> Option<&str> {
        self.network_url.as_deref()
    }

    pub fn usb_index(&self) -> u32 {
        self.usb_index
    }

    pub fn onboard_device(&self) -> &str {
        &self.onboard_device
    }

    pub fn network_timeout(&self) -> Duration {
        self.network_timeout
    }
}

/// Capability every capture backend offers to the recognition loop.
pub trait FrameSource {
    /// Open the underlying OS resource.
    fn initialize(&mut self) -> Result<(), SourceError>;

    /// Grab one 320×240 RGB frame, or `None` if the read failed.
    fn capture_frame(&mut self) -> Option<Frame>;

    /// Close the resource. Idempotent; never fails.
    fn release(&mut self);
}

enum Backend {
    Onboard(OnboardCamera),
    Network(NetworkStream),
    Usb(UsbDevice),
}

/// Video source selected from a `VideoSourceConfig` at construction time.
pub struct VideoSource {
    backend: Backend,
    kind: SourceKind,
}

impl VideoSource {
    pub fn new(config: &VideoSourceConfig) -> Self {
        let backend = match config.kind() {
            SourceKind::Onboard => Backend::Onboard(OnboardCamera::new(config.onboard_device())),
            SourceKind::NetworkStream => Backend::Network(NetworkStream::new(
                config.network_url().unwrap_or_default(),
                config.network_timeout(),
            )),
            SourceKind::Usb => Backend::Usb(UsbDevice::new(config.usb_index())),
        };
        Self {
            backend,
            kind: config.kind(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Human-readable location of the source, for logs.
    pub fn describe(&self) -> String {
        match &self.backend {
            Backend::Onboard(camera) => camera.device_path().to_string(),
            Backend::Network(stream) => stream.url().to_string(),
            Backend::Usb(device) => device.device_path(),
        }
    }

    fn capture(&mut self) -> Result<Frame, SourceError> {
        match &mut self.backend {
            Backend::Onboard(camera) => camera.capture(),
            Backend::Network(stream) => stream.capture(),
            Backend::Usb(device) => device.capture(),
        }
    }
}

impl FrameSource for VideoSource {
    fn initialize(&mut self) -> Result<(), SourceError> {
        let result = match &mut self.backend {
            Backend::Onboard(camera) => camera.initialize(),
            Backend::Network(stream) => stream.initialize(),
            Backend::Usb(device) => device.initialize(),
        };
        if let Err(err) = &result {
            tracing::error!(
                kind = %self.kind,
                source = %self.describe(),
                error = %err,
                "failed to initialize video source"
            );
        }
        result
    }

    fn capture_frame(&mut self) -> Option<Frame> {
        match self.capture() {
            Ok(frame) => Some(frame),
            Err(err) => {
                tracing::warn!(kind = %self.kind, error = %err, "could not read frame from video source");
                None
            }
        }
    }

    fn release(&mut self) {
        match &mut self.backend {
            Backend::Onboard(camera) => camera.release(),
            Backend::Network(stream) => stream.release(),
            Backend::Usb(device) => device.release(),
        }
    }
}

/// Scoped acquisition of a frame source: initialized on `acquire`, released on drop.
pub struct SourceGuard<S: FrameSource> {
    source: S,
}

impl<S: FrameSource> SourceGuard<S> {
    /// Initialize `source`. On failure the source is released before the
    /// error is returned.
    pub fn acquire(mut source: S) -> Result<Self, SourceError> {
        if let Err(err) = source.initialize() {
            source.release();
            return Err(err);
        }
        Ok(Self { source })
    }
}

impl<S: FrameSource> Deref for SourceGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.source
    }
}

impl<S: FrameSource> DerefMut for SourceGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: FrameSource> Drop for SourceGuard<S> {
    fn drop(&mut self) {
        self.source.release();
    }
}
