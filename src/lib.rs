//! SilkCast - on-demand live streams from local capture devices
//!
//! A single-host HTTP service that exposes V4L2 video capture devices as
//! multipart MJPEG, raw Annex-B H.264, fragmented MP4 or fragmented UDP
//! streams, with one shared capture session per device.

#[cfg(feature = "h264")]
pub mod client;
pub mod error;
pub mod params;
pub mod session;
pub mod stream;
pub mod video;
pub mod web;

pub use error::{AppError, Result};
