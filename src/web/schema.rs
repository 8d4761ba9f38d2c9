//! Route schema served by `/api/schema`
//!
//! One descriptor per route with its parameters, types, defaults and
//! enumerated options; the interactive index page renders itself from the
//! same data.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RouteParam {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub default: &'static str,
    pub description: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<&'static str>,
}

impl RouteParam {
    fn new(
        name: &'static str,
        kind: &'static str,
        default: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind,
            default,
            description,
            options: Vec::new(),
        }
    }

    fn select(
        name: &'static str,
        default: &'static str,
        description: &'static str,
        options: &[&'static str],
    ) -> Self {
        Self {
            name,
            kind: "select",
            default,
            description,
            options: options.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSpec {
    pub path: &'static str,
    pub method: &'static str,
    pub description: &'static str,
    pub params: Vec<RouteParam>,
}

fn device_param() -> RouteParam {
    RouteParam::new("device", "device", "video0", "Device ID")
}

fn stream_params() -> Vec<RouteParam> {
    vec![
        RouteParam::new("w", "int", "640", "Width"),
        RouteParam::new("h", "int", "480", "Height"),
        RouteParam::new("fps", "int", "15", "Framerate"),
        RouteParam::new("bitrate", "int", "256", "Bitrate (kbps)"),
        RouteParam::new("quality", "int", "80", "JPEG quality (1-100)"),
        RouteParam::new("gop", "int", "30", "GOP size"),
    ]
}

/// Every route this service exposes, in presentation order.
pub fn routes() -> Vec<RouteSpec> {
    let mut live_params = vec![device_param()];
    live_params.extend(stream_params());
    live_params.push(RouteParam::select(
        "codec",
        "mjpeg",
        "Video codec",
        &["mjpeg", "h264"],
    ));
    live_params.push(RouteParam::select(
        "latency",
        "view",
        "Latency mode",
        &["view", "low", "ultra", "zerolatency"],
    ));
    live_params.push(RouteParam::select(
        "container",
        "raw",
        "Container format",
        &["raw", "mp4"],
    ));

    let mut udp_params = vec![
        device_param(),
        RouteParam::new("target", "string", "127.0.0.1", "Target IPv4 address"),
        RouteParam::new("port", "int", "5000", "Target port"),
        RouteParam::new("duration", "int", "10", "Duration (seconds)"),
    ];
    udp_params.extend(stream_params());
    udp_params.push(RouteParam::select(
        "codec",
        "h264",
        "Video codec",
        &["h264", "mjpeg"],
    ));

    vec![
        RouteSpec {
            path: "/",
            method: "GET",
            description: "Interactive API reference",
            params: vec![],
        },
        RouteSpec {
            path: "/api/schema",
            method: "GET",
            description: "Describe every route and its parameters",
            params: vec![],
        },
        RouteSpec {
            path: "/device/list",
            method: "GET",
            description: "List available video devices",
            params: vec![],
        },
        RouteSpec {
            path: "/device/{device}/caps",
            method: "GET",
            description: "Get device native capabilities",
            params: vec![device_param()],
        },
        RouteSpec {
            path: "/stream/{device}/stats",
            method: "GET",
            description: "Get stream statistics",
            params: vec![device_param()],
        },
        RouteSpec {
            path: "/stream/{device}/feedback",
            method: "POST",
            description: "Send stream feedback (type=idr forces a keyframe)",
            params: vec![
                device_param(),
                RouteParam::select("type", "idr", "Feedback type", &["idr"]),
            ],
        },
        RouteSpec {
            path: "/stream/live/{device}",
            method: "GET",
            description: "Start a live stream",
            params: live_params,
        },
        RouteSpec {
            path: "/stream/udp/{device}",
            method: "GET",
            description: "Start a UDP push stream",
            params: udp_params,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_covers_all_routes() {
        let routes = routes();
        let paths: Vec<_> = routes.iter().map(|r| r.path).collect();
        assert_eq!(
            paths,
            vec![
                "/",
                "/api/schema",
                "/device/list",
                "/device/{device}/caps",
                "/stream/{device}/stats",
                "/stream/{device}/feedback",
                "/stream/live/{device}",
                "/stream/udp/{device}",
            ]
        );
    }

    #[test]
    fn test_live_route_parameters() {
        let routes = routes();
        let live = routes
            .iter()
            .find(|r| r.path == "/stream/live/{device}")
            .unwrap();
        let names: Vec<_> = live.params.iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec!["device", "w", "h", "fps", "bitrate", "quality", "gop", "codec", "latency", "container"]
        );

        let codec = live.params.iter().find(|p| p.name == "codec").unwrap();
        assert_eq!(codec.kind, "select");
        assert_eq!(codec.options, vec!["mjpeg", "h264"]);
    }

    #[test]
    fn test_schema_serializes_options_only_when_present() {
        let routes = routes();
        let json = serde_json::to_value(&routes).unwrap();
        let live = &json[6];
        assert_eq!(live["path"], "/stream/live/{device}");
        // Plain int params carry no options array.
        assert!(live["params"][1].get("options").is_none());
        assert_eq!(live["params"][1]["type"], "int");
    }
}
