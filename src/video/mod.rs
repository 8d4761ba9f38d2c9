//! Video capture, pixel conversion and encoding

pub mod capture;
pub mod convert;
pub mod device;
#[cfg(feature = "h264")]
pub mod encoder;
pub mod format;

pub use capture::CaptureDriver;
pub use format::PixelFormat;
