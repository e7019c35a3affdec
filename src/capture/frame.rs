use serde::{Deserialize, Serialize};

/// Pixel formats a capture device can deliver into a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    Mono8,
    Mono16,
    Mono32,
    Rgb24,
    Bgr24,
    Rgba32,
    Yuyv4,
    Nv12,
}

impl PixelFormat {
    /// Size of one pixel in bits (NV12 averages 12 bits per pixel)
    pub fn bits_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 8,
            PixelFormat::Nv12 => 12,
            PixelFormat::Mono16 | PixelFormat::Yuyv4 => 16,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 24,
            PixelFormat::Mono32 | PixelFormat::Rgba32 => 32,
        }
    }
}

/// Frame geometry: the shape of one captured frame.
///
/// Only [`FrameDim::byte_size`] and equality matter to the buffer pools. The
/// default value is the "unset" geometry held by an empty pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameDim {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameDim {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    /// Bytes needed to hold one frame. Returns 0 for an empty or
    /// unrepresentable geometry.
    pub fn byte_size(&self) -> usize {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|pixels| pixels.checked_mul(self.format.bits_per_pixel()))
            .map(|bits| bits / 8)
            .unwrap_or(0)
    }

    pub fn is_set(&self) -> bool {
        self.byte_size() > 0
    }
}
