use std::time::Duration;

use bytes::Bytes;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Red, Green, Blue, Alpha
    #[default]
    Rgba,
    /// Blue, Green, Red, Alpha
    Bgra,
}

impl PixelFormat {
    #[must_use]
    pub const fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// Orientation tag attached by the capture device. Pixels are never rotated
/// by the compositor; the tag travels with the frame to the encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    #[must_use]
    pub const fn degrees(self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }
}

/// Raw camera frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub rotation: Rotation,
    /// Capture time relative to the start of the stream
    pub timestamp: Duration,
    pub sequence: u64,
}

impl Frame {
    /// Wrap a packed buffer, checking that its length matches the dimensions.
    pub fn new(
        data: Bytes,
        width: u32,
        height: u32,
        format: PixelFormat,
        rotation: Rotation,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Render(format!("empty frame {width}x{height}")));
        }
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if data.len() != expected {
            return Err(Error::Render(format!(
                "frame buffer is {} bytes, expected {expected} for {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            rotation,
            timestamp: Duration::ZERO,
            sequence: 0,
        })
    }

    pub fn from_rgba(image: RgbaImage, rotation: Rotation) -> Result<Self> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::Render(format!("empty frame {width}x{height}")));
        }
        Ok(Self {
            data: Bytes::from(image.into_raw()),
            width,
            height,
            format: PixelFormat::Rgba,
            rotation,
            timestamp: Duration::ZERO,
            sequence: 0,
        })
    }

    #[must_use]
    pub const fn with_timing(mut self, timestamp: Duration, sequence: u64) -> Self {
        self.timestamp = timestamp;
        self.sequence = sequence;
        self
    }

    /// Decode into an RGBA image, swizzling BGRA input.
    pub fn to_rgba(&self) -> Result<RgbaImage> {
        let mut raw = self.data.to_vec();
        if self.format == PixelFormat::Bgra {
            for px in raw.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
        }
        RgbaImage::from_raw(self.width, self.height, raw).ok_or_else(|| {
            Error::Render(format!(
                "frame buffer does not fit {}x{}",
                self.width, self.height
            ))
        })
    }
}

/// Frame at the current output size, always RGBA
#[derive(Debug, Clone)]
pub struct CompositedFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub timestamp: Duration,
    pub sequence: u64,
}

impl CompositedFrame {
    pub(crate) fn from_image(image: RgbaImage, source: &Frame) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: Bytes::from(image.into_raw()),
            width,
            height,
            rotation: source.rotation,
            timestamp: source.timestamp,
            sequence: source.sequence,
        }
    }

    pub fn to_rgba(&self) -> Result<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.data.to_vec())
            .ok_or_else(|| Error::Render("composited buffer size mismatch".to_string()))
    }
}
