//! V4L2 device enumeration and capability probe

use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;
use v4l::capability::Flags;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

use crate::error::{AppError, Result};

/// Resolve a device id to its node path. Absolute ids are used verbatim,
/// anything else is looked up under `/dev`.
pub fn resolve_device_path(device_id: &str) -> PathBuf {
    if device_id.starts_with('/') {
        PathBuf::from(device_id)
    } else {
        PathBuf::from("/dev").join(device_id)
    }
}

/// Enumerate capture-capable `/dev/video*` nodes, sorted by name.
///
/// Returns a `video0` placeholder when nothing is found so clients always
/// have a name to try.
pub fn list_devices() -> Vec<String> {
    let mut devices = Vec::new();

    let entries = match std::fs::read_dir("/dev") {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Failed to read /dev: {}", e);
            return vec!["video0".to_string()];
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("video") {
            continue;
        }

        match Device::with_path(entry.path()) {
            Ok(device) => match device.query_caps() {
                Ok(caps) if caps.capabilities.contains(Flags::VIDEO_CAPTURE) => {
                    devices.push(name.to_string());
                }
                Ok(_) => debug!("Skipping non-capture device: {}", name),
                Err(e) => debug!("Failed to query {}: {}", name, e),
            },
            Err(e) => debug!("Failed to open {}: {}", name, e),
        }
    }

    if devices.is_empty() {
        devices.push("video0".to_string());
    }
    devices.sort();
    devices
}

fn fourcc_string(fourcc: FourCC) -> String {
    String::from_utf8_lossy(&fourcc.repr).into_owned()
}

/// Capability report for one device: identity, current mode and every
/// supported (format x size x framerate) tuple.
#[derive(Debug, Serialize)]
pub struct DeviceCaps {
    pub device: String,
    pub card: String,
    pub driver: String,
    pub bus_info: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<CurrentMode>,
    pub formats: Vec<FormatCaps>,
}

#[derive(Debug, Serialize)]
pub struct CurrentMode {
    pub width: u32,
    pub height: u32,
    pub fourcc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct FormatCaps {
    pub fourcc: String,
    pub description: String,
    pub sizes: Vec<SizeCaps>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SizeCaps {
    Discrete {
        #[serde(rename = "type")]
        kind: &'static str,
        width: u32,
        height: u32,
        intervals: Vec<IntervalCaps>,
    },
    Stepwise {
        #[serde(rename = "type")]
        kind: &'static str,
        min_width: u32,
        max_width: u32,
        step_width: u32,
        min_height: u32,
        max_height: u32,
        step_height: u32,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum IntervalCaps {
    Discrete {
        numerator: u32,
        denominator: u32,
    },
    Stepwise {
        #[serde(rename = "type")]
        kind: &'static str,
        min: FractionCaps,
        max: FractionCaps,
        step: FractionCaps,
    },
}

#[derive(Debug, Serialize)]
pub struct FractionCaps {
    pub numerator: u32,
    pub denominator: u32,
}

/// Probe a device for its full capability report.
pub fn probe_caps(device_id: &str) -> Result<DeviceCaps> {
    let path = resolve_device_path(device_id);
    let device = Device::with_path(&path)
        .map_err(|e| AppError::CapsUnavailable(format!("failed to open device: {}", e)))?;

    let caps = device
        .query_caps()
        .map_err(|e| AppError::CapsUnavailable(format!("capability query failed: {}", e)))?;
    if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
        return Err(AppError::CapsUnavailable(
            "device does not support video capture".into(),
        ));
    }

    let current = device.format().ok().map(|fmt| {
        let fps = device.params().ok().and_then(|p| {
            let interval = p.interval;
            if interval.numerator > 0 && interval.denominator > 0 {
                Some(interval.denominator / interval.numerator)
            } else {
                None
            }
        });
        CurrentMode {
            width: fmt.width,
            height: fmt.height,
            fourcc: fourcc_string(fmt.fourcc),
            fps,
        }
    });

    let mut formats = Vec::new();
    for desc in device.enum_formats().unwrap_or_default() {
        let sizes = enumerate_sizes(&device, desc.fourcc);
        formats.push(FormatCaps {
            fourcc: fourcc_string(desc.fourcc),
            description: desc.description.clone(),
            sizes,
        });
    }

    Ok(DeviceCaps {
        device: device_id.to_string(),
        card: caps.card,
        driver: caps.driver,
        bus_info: caps.bus,
        current,
        formats,
    })
}

fn enumerate_sizes(device: &Device, fourcc: FourCC) -> Vec<SizeCaps> {
    let mut sizes = Vec::new();

    let frame_sizes = match device.enum_framesizes(fourcc) {
        Ok(sizes) => sizes,
        Err(e) => {
            debug!("Failed to enumerate frame sizes for {:?}: {}", fourcc, e);
            return sizes;
        }
    };

    for size in frame_sizes {
        match size.size {
            v4l::framesize::FrameSizeEnum::Discrete(d) => {
                let intervals = enumerate_intervals(device, fourcc, d.width, d.height);
                sizes.push(SizeCaps::Discrete {
                    kind: "discrete",
                    width: d.width,
                    height: d.height,
                    intervals,
                });
            }
            v4l::framesize::FrameSizeEnum::Stepwise(s) => {
                sizes.push(SizeCaps::Stepwise {
                    kind: "stepwise",
                    min_width: s.min_width,
                    max_width: s.max_width,
                    step_width: s.step_width,
                    min_height: s.min_height,
                    max_height: s.max_height,
                    step_height: s.step_height,
                });
            }
        }
    }

    sizes
}

fn enumerate_intervals(device: &Device, fourcc: FourCC, width: u32, height: u32) -> Vec<IntervalCaps> {
    let mut intervals = Vec::new();

    let frame_intervals = match device.enum_frameintervals(fourcc, width, height) {
        Ok(intervals) => intervals,
        Err(_) => return intervals,
    };

    for interval in frame_intervals {
        match interval.interval {
            v4l::frameinterval::FrameIntervalEnum::Discrete(fraction) => {
                intervals.push(IntervalCaps::Discrete {
                    numerator: fraction.numerator,
                    denominator: fraction.denominator,
                });
            }
            v4l::frameinterval::FrameIntervalEnum::Stepwise(step) => {
                intervals.push(IntervalCaps::Stepwise {
                    kind: "stepwise",
                    min: FractionCaps {
                        numerator: step.min.numerator,
                        denominator: step.min.denominator,
                    },
                    max: FractionCaps {
                        numerator: step.max.numerator,
                        denominator: step.max.denominator,
                    },
                    step: FractionCaps {
                        numerator: step.step.numerator,
                        denominator: step.step.denominator,
                    },
                });
                break;
            }
        }
    }

    intervals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_device_path() {
        assert_eq!(resolve_device_path("video0"), PathBuf::from("/dev/video0"));
        assert_eq!(
            resolve_device_path("/dev/video2"),
            PathBuf::from("/dev/video2")
        );
    }

    #[test]
    fn test_caps_json_shape() {
        let caps = DeviceCaps {
            device: "video0".into(),
            card: "Test Cam".into(),
            driver: "uvcvideo".into(),
            bus_info: "usb-0000:00:14.0-1".into(),
            current: Some(CurrentMode {
                width: 640,
                height: 480,
                fourcc: "MJPG".into(),
                fps: Some(30),
            }),
            formats: vec![FormatCaps {
                fourcc: "MJPG".into(),
                description: "Motion-JPEG".into(),
                sizes: vec![SizeCaps::Discrete {
                    kind: "discrete",
                    width: 640,
                    height: 480,
                    intervals: vec![IntervalCaps::Discrete {
                        numerator: 1,
                        denominator: 30,
                    }],
                }],
            }],
        };

        let json: serde_json::Value = serde_json::to_value(&caps).unwrap();
        assert_eq!(json["device"], "video0");
        assert_eq!(json["current"]["fps"], 30);
        assert_eq!(json["formats"][0]["sizes"][0]["type"], "discrete");
        assert_eq!(
            json["formats"][0]["sizes"][0]["intervals"][0]["denominator"],
            30
        );
    }
}
