//! Stream parameter model and query parsing.
//!
//! Every `/stream/*` request is reduced to a canonical [`CaptureParams`]
//! before it touches a session. Parsing is done by hand (rather than through
//! an extractor) so malformed values surface as this service's `bad_request`
//! JSON instead of the framework's plain-text rejection.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Output codec requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Mjpeg,
    H264,
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Mjpeg => write!(f, "mjpeg"),
            Codec::H264 => write!(f, "h264"),
        }
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mjpeg" => Ok(Codec::Mjpeg),
            "h264" => Ok(Codec::H264),
            other => Err(format!("unknown codec: {}", other)),
        }
    }
}

/// Latency preset applied on top of the raw parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyMode {
    View,
    Low,
    Ultra,
    Zerolatency,
}

impl fmt::Display for LatencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LatencyMode::View => write!(f, "view"),
            LatencyMode::Low => write!(f, "low"),
            LatencyMode::Ultra => write!(f, "ultra"),
            LatencyMode::Zerolatency => write!(f, "zerolatency"),
        }
    }
}

impl FromStr for LatencyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "view" => Ok(LatencyMode::View),
            "low" => Ok(LatencyMode::Low),
            "ultra" => Ok(LatencyMode::Ultra),
            "zerolatency" => Ok(LatencyMode::Zerolatency),
            other => Err(format!("unknown latency mode: {}", other)),
        }
    }
}

/// Wire container for the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Raw,
    Mp4,
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Container::Raw => write!(f, "raw"),
            Container::Mp4 => write!(f, "mp4"),
        }
    }
}

impl FromStr for Container {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Container::Raw),
            "mp4" => Ok(Container::Mp4),
            other => Err(format!("unknown container: {}", other)),
        }
    }
}

/// Requested shape of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// JPEG quality (1-100), negotiated down to the driver for MJPEG sessions.
    pub quality: u32,
    pub gop: u32,
    pub codec: Codec,
    pub latency: LatencyMode,
    pub container: Container,
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15,
            bitrate_kbps: 256,
            quality: 80,
            gop: 30,
            codec: Codec::Mjpeg,
            latency: LatencyMode::View,
            container: Container::Raw,
        }
    }
}

impl CaptureParams {
    /// Parse from the raw query map, falling back to `default_codec` when no
    /// codec was given. Applies the latency preset afterwards.
    pub fn from_query(query: &HashMap<String, String>, default_codec: Codec) -> Result<Self> {
        let mut p = CaptureParams {
            codec: default_codec,
            ..Default::default()
        };

        if let Some(v) = query.get("w") {
            p.width = parse_int(v, "w")?;
        }
        if let Some(v) = query.get("h") {
            p.height = parse_int(v, "h")?;
        }
        if let Some(v) = query.get("fps") {
            p.fps = parse_int(v, "fps")?;
        }
        if let Some(v) = query.get("bitrate") {
            p.bitrate_kbps = parse_int(v, "bitrate")?;
        }
        if let Some(v) = query.get("quality") {
            p.quality = parse_int(v, "quality")?;
        }
        if let Some(v) = query.get("gop") {
            p.gop = parse_int(v, "gop")?;
        }
        if let Some(v) = query.get("codec") {
            p.codec = v.parse().map_err(AppError::BadRequest)?;
        }
        if let Some(v) = query.get("latency") {
            p.latency = v.parse().map_err(AppError::BadRequest)?;
        }
        if let Some(v) = query.get("container") {
            p.container = v.parse().map_err(AppError::BadRequest)?;
        }

        p.apply_latency_preset();
        Ok(p)
    }

    /// `zerolatency` rewrites the stream to a minimal-delay H.264 shape:
    /// raw Annex-B, GOP of 1, at least 512 kbit/s, then downgrades itself
    /// to `ultra` so the effective header reports a plain mode.
    pub fn apply_latency_preset(&mut self) {
        if self.latency == LatencyMode::Zerolatency {
            if self.codec == Codec::Mjpeg {
                self.codec = Codec::H264;
            }
            if self.container == Container::Mp4 {
                self.container = Container::Raw;
            }
            self.gop = 1;
            if self.bitrate_kbps < 512 {
                self.bitrate_kbps = 512;
            }
            self.latency = LatencyMode::Ultra;
        }
    }

    /// Schema-level validation; runs before the session's client count is
    /// touched.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(AppError::BadRequest(
                "width and height must be positive".into(),
            ));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(AppError::BadRequest("width and height must be even".into()));
        }
        if self.fps < 1 {
            return Err(AppError::BadRequest("fps must be at least 1".into()));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(AppError::BadRequest("quality must be within 1..=100".into()));
        }
        if self.container == Container::Mp4 && self.codec != Codec::H264 {
            return Err(AppError::BadRequest("mp4 container requires h264".into()));
        }
        Ok(())
    }

    /// Frame pacing interval in milliseconds, never below 1 ms.
    pub fn frame_interval_ms(&self) -> u64 {
        (1000 / self.fps.max(1)).max(1) as u64
    }
}

fn parse_int(value: &str, name: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| AppError::BadRequest(format!("invalid integer for {}: {}", name, value)))
}

/// (requested, actual) parameter pair reported back to the client.
#[derive(Debug, Clone)]
pub struct EffectiveParams {
    pub requested: CaptureParams,
    pub actual: CaptureParams,
}

impl EffectiveParams {
    pub fn new(requested: CaptureParams, actual: CaptureParams) -> Self {
        Self { requested, actual }
    }

    /// Value of the `Effective-Params` response header.
    pub fn header_value(&self) -> String {
        let a = &self.actual;
        format!(
            "codec={};w={};h={};fps={};bitrate={};quality={};gop={};latency={};container={}",
            a.codec,
            a.width,
            a.height,
            a.fps,
            a.bitrate_kbps,
            a.quality,
            a.gop,
            a.latency,
            a.container
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let p = CaptureParams::default();
        assert_eq!(p.width, 640);
        assert_eq!(p.height, 480);
        assert_eq!(p.fps, 15);
        assert_eq!(p.bitrate_kbps, 256);
        assert_eq!(p.quality, 80);
        assert_eq!(p.gop, 30);
        assert_eq!(p.codec, Codec::Mjpeg);
        assert_eq!(p.container, Container::Raw);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_parse_full_query() {
        let q = query(&[
            ("w", "1280"),
            ("h", "720"),
            ("fps", "30"),
            ("bitrate", "2000"),
            ("quality", "90"),
            ("gop", "60"),
            ("codec", "h264"),
            ("latency", "low"),
            ("container", "mp4"),
        ]);
        let p = CaptureParams::from_query(&q, Codec::Mjpeg).unwrap();
        assert_eq!(p.width, 1280);
        assert_eq!(p.height, 720);
        assert_eq!(p.fps, 30);
        assert_eq!(p.bitrate_kbps, 2000);
        assert_eq!(p.quality, 90);
        assert_eq!(p.gop, 60);
        assert_eq!(p.codec, Codec::H264);
        assert_eq!(p.latency, LatencyMode::Low);
        assert_eq!(p.container, Container::Mp4);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_default_codec_applies_when_absent() {
        let p = CaptureParams::from_query(&query(&[]), Codec::H264).unwrap();
        assert_eq!(p.codec, Codec::H264);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(CaptureParams::from_query(&query(&[("w", "abc")]), Codec::Mjpeg).is_err());
        assert!(CaptureParams::from_query(&query(&[("codec", "vp9")]), Codec::Mjpeg).is_err());
        assert!(CaptureParams::from_query(&query(&[("container", "ts")]), Codec::Mjpeg).is_err());
    }

    #[test]
    fn test_zerolatency_preset() {
        let q = query(&[("latency", "zerolatency")]);
        let p = CaptureParams::from_query(&q, Codec::Mjpeg).unwrap();
        assert_eq!(p.codec, Codec::H264);
        assert_eq!(p.container, Container::Raw);
        assert_eq!(p.gop, 1);
        assert_eq!(p.bitrate_kbps, 512);
        assert_eq!(p.latency, LatencyMode::Ultra);
    }

    #[test]
    fn test_zerolatency_keeps_higher_bitrate() {
        let q = query(&[("latency", "zerolatency"), ("bitrate", "4000")]);
        let p = CaptureParams::from_query(&q, Codec::Mjpeg).unwrap();
        assert_eq!(p.bitrate_kbps, 4000);
    }

    #[test]
    fn test_zerolatency_rewrites_mp4_container() {
        let q = query(&[
            ("latency", "zerolatency"),
            ("codec", "h264"),
            ("container", "mp4"),
        ]);
        let p = CaptureParams::from_query(&q, Codec::Mjpeg).unwrap();
        assert_eq!(p.container, Container::Raw);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validation_rules() {
        let mut p = CaptureParams::default();
        p.width = 641;
        assert!(p.validate().is_err());

        let mut p = CaptureParams::default();
        p.height = 0;
        assert!(p.validate().is_err());

        let mut p = CaptureParams::default();
        p.fps = 0;
        assert!(p.validate().is_err());

        let mut p = CaptureParams::default();
        p.quality = 0;
        assert!(p.validate().is_err());
        p.quality = 101;
        assert!(p.validate().is_err());

        let mut p = CaptureParams::default();
        p.container = Container::Mp4;
        assert_eq!(p.codec, Codec::Mjpeg);
        assert!(matches!(p.validate(), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_effective_params_header() {
        let p = CaptureParams::default();
        let eff = EffectiveParams::new(p.clone(), p);
        assert_eq!(
            eff.header_value(),
            "codec=mjpeg;w=640;h=480;fps=15;bitrate=256;quality=80;gop=30;latency=view;container=raw"
        );
    }

    #[test]
    fn test_frame_interval() {
        let mut p = CaptureParams::default();
        p.fps = 30;
        assert_eq!(p.frame_interval_ms(), 33);
        p.fps = 2000;
        assert_eq!(p.frame_interval_ms(), 1);
    }
}
