//! V4L2 camera capture via the `v4l` crate.
//!
//! Backs two of the three source kinds: the onboard camera module (exposed
//! by its driver as a V4L2 node, usually `/dev/video0`) and USB cameras
//! (`/dev/video<index>`).

use crate::frame::{self, Frame, FRAME_HEIGHT, FRAME_WIDTH};
use crate::source::SourceError;
use image::RgbImage;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed RGB24 (3 bytes/pixel, already in output order).
    Rgb24,
    /// Packed BGR24 (3 bytes/pixel, channels reversed).
    Bgr24,
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion JPEG, one JPEG per buffer.
    Mjpeg,
}

impl PixelFormat {
    fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        }
    }

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        [
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Yuyv,
            PixelFormat::Mjpeg,
        ]
        .into_iter()
        .find(|format| format.fourcc() == fourcc)
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    /// Bytes per line reported by the driver; rows may carry padding.
    pub stride: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    sequence: u64,
}

impl Camera {
    /// Open a V4L2 device and request 320×240 in the preferred pixel format.
    ///
    /// The driver may answer with another size or format; any of the four
    /// supported formats is accepted and converted at capture time.
    pub fn open(device_path: &str, preferred: PixelFormat) -> Result<Self, SourceError> {
        if !Path::new(device_path).exists() {
            return Err(SourceError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                SourceError::DeviceBusy(device_path.to_string())
            } else {
                SourceError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            SourceError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(SourceError::StreamingNotSupported(device_path.to_string()));
        }

        let mut fmt = device.format().map_err(|e| {
            SourceError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = preferred.fourcc();
        fmt.width = FRAME_WIDTH;
        fmt.height = FRAME_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            SourceError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            SourceError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need RGB3, BGR3, YUYV or MJPG)"
            ))
        })?;

        if negotiated.width != FRAME_WIDTH || negotiated.height != FRAME_HEIGHT {
            tracing::debug!(
                width = negotiated.width,
                height = negotiated.height,
                "driver ignored requested size; frames will be resized"
            );
        }

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            stride = negotiated.stride,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            stride: negotiated.stride,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
            sequence: 0,
        })
    }

    /// Capture a single frame, converted to RGB and normalized to 320×240.
    pub fn capture_frame(&mut self) -> Result<Frame, SourceError> {
        let mut stream =
            MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4).map_err(|e| {
                SourceError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| SourceError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let used = (meta.bytesused as usize).min(buf.len());
        let used = if used == 0 { buf.len() } else { used };
        let rgb = self.buf_to_rgb(&buf[..used])?;

        self.sequence += 1;
        tracing::debug!(
            device = %self.device_path,
            seq = self.sequence,
            driver_seq = meta.sequence,
            "captured frame"
        );

        Ok(Frame::normalized(rgb, self.sequence))
    }

    /// Convert a raw buffer to RGB based on the negotiated format.
    fn buf_to_rgb(&self, buf: &[u8]) -> Result<RgbImage, SourceError> {
        raw_to_rgb(
            self.pixel_format,
            buf,
            self.width,
            self.height,
            self.stride as usize,
        )
    }
}

fn raw_to_rgb(
    format: PixelFormat,
    buf: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<RgbImage, SourceError> {
    let image = match format {
        PixelFormat::Rgb24 => frame::rgb24_to_image(buf, width, height, stride)?,
        PixelFormat::Bgr24 => frame::bgr24_to_rgb(buf, width, height, stride)?,
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height, stride)?,
        PixelFormat::Mjpeg => frame::decode_jpeg(buf)?,
    };
    Ok(image)
}

/// Raspberry Pi style camera module exposed as a V4L2 node.
pub struct OnboardCamera {
    device_path: String,
    camera: Option<Camera>,
}

impl OnboardCamera {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            camera: None,
        }
    }

    pub fn initialize(&mut self) -> Result<(), SourceError> {
        // The camera module delivers RGB at the requested resolution.
        let camera = Camera::open(&self.device_path, PixelFormat::Rgb24)?;
        tracing::info!(device = %self.device_path, "onboard camera initialized");
        self.camera = Some(camera);
        Ok(())
    }

    pub fn capture(&mut self) -> Result<Frame, SourceError> {
        self.camera
            .as_mut()
            .ok_or(SourceError::NotInitialized)?
            .capture_frame()
    }

    pub fn release(&mut self) {
        if let Some(camera) = self.camera.take() {
            tracing::info!(device = %camera.device_path, "onboard camera released");
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

/// USB camera addressed by its V4L2 index.
pub struct UsbDevice {
    index: u32,
    camera: Option<Camera>,
}

impl UsbDevice {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            camera: None,
        }
    }

    /// `/dev/video<index>`.
    pub fn device_path(&self) -> String {
        format!("/dev/video{}", self.index)
    }

    pub fn initialize(&mut self) -> Result<(), SourceError> {
        // UVC cameras almost always offer YUYV; the driver may pick MJPG or BGR3 instead.
        let camera = Camera::open(&self.device_path(), PixelFormat::Yuyv)?;
        tracing::info!(index = self.index, "USB camera initialized");
        self.camera = Some(camera);
        Ok(())
    }

    pub fn capture(&mut self) -> Result<Frame, SourceError> {
        self.camera
            .as_mut()
            .ok_or(SourceError::NotInitialized)?
            .capture_frame()
    }

    pub fn release(&mut self) {
        if self.camera.take().is_some() {
            tracing::info!(index = self.index, "USB camera released");
        }
    }
}
