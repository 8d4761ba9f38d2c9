//! Pixel format definitions

use std::fmt;

use serde::{Deserialize, Serialize};
use v4l::format::fourcc::FourCC;

/// Pixel format negotiated with the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// MJPEG compressed frames straight off the device
    Mjpeg,
    /// YUYV 4:2:2 packed
    Yuyv,
    /// NV12 semi-planar (Y plane + interleaved UV)
    Nv12,
    /// Anything the service cannot transcode
    Unknown,
}

impl PixelFormat {
    pub fn to_fourcc(self) -> FourCC {
        match self {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv => FourCC::new(b"YUYV"),
            PixelFormat::Nv12 => FourCC::new(b"NV12"),
            PixelFormat::Unknown => FourCC::new(b"\0\0\0\0"),
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Self {
        match &fourcc.repr {
            b"MJPG" | b"JPEG" => PixelFormat::Mjpeg,
            b"YUYV" => PixelFormat::Yuyv,
            b"NV12" => PixelFormat::Nv12,
            _ => PixelFormat::Unknown,
        }
    }

    /// True for formats the H.264 path can convert to planar 4:2:0.
    pub fn is_encodable(self) -> bool {
        matches!(self, PixelFormat::Yuyv | PixelFormat::Nv12)
    }

    /// Uncompressed frame size in bytes, `None` for compressed formats.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width * height) as usize;
        match self {
            PixelFormat::Yuyv => Some(pixels * 2),
            PixelFormat::Nv12 => Some(pixels * 3 / 2),
            PixelFormat::Mjpeg | PixelFormat::Unknown => None,
        }
    }

    /// Short lowercase label used in stats and error payloads.
    pub fn label(self) -> &'static str {
        match self {
            PixelFormat::Mjpeg => "mjpeg",
            PixelFormat::Yuyv => "yuyv",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}
