//! H.264 encoder (OpenH264)
//!
//! Thin wrapper over the `openh264` crate configured for real-time camera
//! capture. Each responder owns its own encoder instance; encoders are never
//! shared between clients because each drives an independent bitstream with
//! its own IDR cadence.

use openh264::encoder::{Encoder, EncoderConfig, RateControlMode};
use openh264::formats::YUVSource;
use openh264::OpenH264API;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::params::CaptureParams;

/// Planar 4:2:0 frame adapter feeding the encoder. Y stride equals the
/// width, chroma strides half of it.
struct PlanarFrame<'a> {
    width: usize,
    height: usize,
    y: &'a [u8],
    u: &'a [u8],
    v: &'a [u8],
}

impl<'a> YUVSource for PlanarFrame<'a> {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.width, self.width / 2, self.width / 2)
    }

    fn y(&self) -> &[u8] {
        self.y
    }

    fn u(&self) -> &[u8] {
        self.u
    }

    fn v(&self) -> &[u8] {
        self.v
    }
}

/// Real-time H.264 encoder for one stream.
pub struct H264Encoder {
    inner: Encoder,
    width: usize,
    height: usize,
    gop: u64,
    frame_index: u64,
    force_next_idr: bool,
}

impl H264Encoder {
    /// Configure for the negotiated stream shape: target bitrate in bits/s,
    /// the stream framerate, and frame-skip disabled so the bitstream stays
    /// continuous even when rate control would rather drop.
    pub fn new(params: &CaptureParams) -> Result<Self> {
        let config = EncoderConfig::new()
            .rate_control_mode(RateControlMode::Bitrate)
            .set_bitrate_bps(params.bitrate_kbps * 1000)
            .max_frame_rate(params.fps as f32)
            .enable_skip_frame(false);

        let inner = Encoder::with_api_config(OpenH264API::from_source(), config)
            .map_err(|e| AppError::H264Unavailable(format!("encoder init failed: {}", e)))?;

        debug!(
            "H264 encoder ready: {}x{} @ {} kbit/s, gop {}",
            params.width, params.height, params.bitrate_kbps, params.gop
        );

        Ok(Self {
            inner,
            width: params.width as usize,
            height: params.height as usize,
            gop: if params.gop > 0 { params.gop as u64 } else { 30 },
            frame_index: 0,
            // First encoded frame must be a keyframe.
            force_next_idr: true,
        })
    }

    /// The next encoded frame will be an IDR carrying parameter sets.
    pub fn force_idr(&mut self) {
        self.force_next_idr = true;
    }

    /// Encode one planar 4:2:0 frame into `out` as a single Annex-B byte
    /// sequence (all NALs of all layers, each with its own start code).
    pub fn encode_i420(&mut self, y: &[u8], u: &[u8], v: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if self.force_next_idr || (self.gop > 0 && self.frame_index % self.gop == 0) {
            self.inner.force_intra_frame();
            self.force_next_idr = false;
        }
        self.frame_index += 1;

        let frame = PlanarFrame {
            width: self.width,
            height: self.height,
            y,
            u,
            v,
        };
        let bitstream = self
            .inner
            .encode(&frame)
            .map_err(|e| AppError::VideoError(format!("encode failed: {}", e)))?;

        out.clear();
        bitstream.write_vec(out);
        if out.is_empty() {
            return Err(AppError::VideoError("encoder produced no output".into()));
        }
        Ok(())
    }
}
