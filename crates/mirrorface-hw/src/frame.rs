//! Frame type and pixel conversions — BGR24, YUYV and JPEG to RGB, resize to 320×240.

use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};

/// Width every backend normalizes to.
pub const FRAME_WIDTH: u32 = 320;
/// Height every backend normalizes to.
pub const FRAME_HEIGHT: u32 = 240;

/// A captured RGB camera frame.
///
/// Always exactly `FRAME_WIDTH`×`FRAME_HEIGHT`, 3 channels, 8 bits per channel;
/// the constructors are the only way to build one.
#[derive(Clone)]
pub struct Frame {
    image: RgbImage,
    /// Per-source capture counter, starting at 1.
    pub sequence: u64,
}

impl Frame {
    /// Wrap an image that already has the frame dimensions.
    pub fn from_rgb(image: RgbImage, sequence: u64) -> Result<Self, FrameError> {
        let actual = image.dimensions();
        if actual != (FRAME_WIDTH, FRAME_HEIGHT) {
            return Err(FrameError::Dimensions {
                expected: (FRAME_WIDTH, FRAME_HEIGHT),
                actual,
            });
        }
        Ok(Self { image, sequence })
    }

    /// Build a frame from an RGB image of any size, resizing with bilinear
    /// filtering when the dimensions differ.
    pub fn normalized(image: RgbImage, sequence: u64) -> Self {
        let image = if image.dimensions() == (FRAME_WIDTH, FRAME_HEIGHT) {
            image
        } else {
            imageops::resize(&image, FRAME_WIDTH, FRAME_HEIGHT, FilterType::Triangle)
        };
        Self { image, sequence }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Copy `height` rows of `row_bytes` out of a buffer whose rows are `stride`
/// bytes apart, dropping any per-row padding.
///
/// A `stride` shorter than a row (drivers that report 0) means tightly packed.
fn packed_rows(
    buf: &[u8],
    format: &'static str,
    row_bytes: usize,
    height: usize,
    stride: usize,
) -> Result<Vec<u8>, FrameError> {
    let stride = stride.max(row_bytes);
    let expected = if height == 0 {
        0
    } else {
        stride * (height - 1) + row_bytes
    };
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    if stride == row_bytes {
        return Ok(buf[..row_bytes * height].to_vec());
    }

    let mut packed = Vec::with_capacity(row_bytes * height);
    for row in buf.chunks(stride).take(height) {
        packed.extend_from_slice(&row[..row_bytes]);
    }
    Ok(packed)
}

/// Interpret an RGB24 buffer with rows `stride` bytes apart.
pub fn rgb24_to_image(
    buf: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<RgbImage, FrameError> {
    let pixels = packed_rows(buf, "RGB24", width as usize * 3, height as usize, stride)?;
    let actual = pixels.len();
    RgbImage::from_raw(width, height, pixels).ok_or(FrameError::InvalidLength {
        format: "RGB24",
        expected: (width * height * 3) as usize,
        actual,
    })
}

/// Convert a BGR24 buffer to RGB by swapping the first and third channel.
pub fn bgr24_to_rgb(
    buf: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<RgbImage, FrameError> {
    let mut pixels = packed_rows(buf, "BGR24", width as usize * 3, height as usize, stride)?;
    for px in pixels.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    let actual = pixels.len();
    RgbImage::from_raw(width, height, pixels).ok_or(FrameError::InvalidLength {
        format: "BGR24",
        expected: (width * height * 3) as usize,
        actual,
    })
}

/// Convert YUYV (4:2:2) to RGB using full-range BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U and V.
pub fn yuyv_to_rgb(
    yuyv: &[u8],
    width: u32,
    height: u32,
    stride: usize,
) -> Result<RgbImage, FrameError> {
    let packed = packed_rows(yuyv, "YUYV", width as usize * 2, height as usize, stride)?;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in packed.chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(clamp_to_u8(y + 1.402 * v));
            rgb.push(clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_to_u8(y + 1.772 * u));
        }
    }

    let actual = packed.len();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        format: "YUYV",
        expected: (width * height * 2) as usize,
        actual,
    })
}

/// Decode a JPEG (or one MJPEG frame) into RGB.
pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage, FrameError> {
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?;
    Ok(image.into_rgb8())
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("frame must be {expected:?}, got {actual:?}")]
    Dimensions {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
}
