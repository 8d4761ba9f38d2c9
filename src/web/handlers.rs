//! HTTP route handlers

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use super::schema::{self, RouteSpec};
use super::AppState;
use crate::error::{AppError, Result};
use crate::params::{CaptureParams, Codec, Container, EffectiveParams};
use crate::session::ClientGuard;
use crate::stream::responders;
use crate::video::device::{self, DeviceCaps};

const INDEX_HTML: &str = include_str!("index.html");
const EFFECTIVE_PARAMS_HEADER: &str = "Effective-Params";

/// `GET /` - interactive reference page
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// `GET /api/schema`
pub async fn api_schema() -> Json<Vec<RouteSpec>> {
    Json(schema::routes())
}

/// `GET /device/list`
pub async fn device_list(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.sessions.list_devices())
}

/// `GET /device/:device/caps`
pub async fn device_caps(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> Result<Json<DeviceCaps>> {
    state.sessions.touch(&device);
    let caps = tokio::task::spawn_blocking(move || device::probe_caps(&device))
        .await
        .map_err(|e| AppError::Internal(format!("caps probe task failed: {}", e)))??;
    Ok(Json(caps))
}

/// Session counter snapshot returned by the stats route.
#[derive(Debug, Serialize)]
pub struct StreamStats {
    pub device: String,
    pub codec: String,
    pub pixel_format: &'static str,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub active_clients: i64,
    pub fps_out: f64,
    pub bitrate_out_kbps: f64,
    pub frames_sent: u64,
    pub bytes_sent: u64,
}

/// `GET /stream/:device/stats`
pub async fn stream_stats(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> Result<Json<StreamStats>> {
    let session = state
        .sessions
        .find(&device)
        .ok_or_else(|| AppError::NotFound(format!("device {}", device)))?;
    session.touch();

    let params = session.params();
    let uptime = session.uptime().as_secs_f64().max(0.001);
    let frames_sent = session.frames_sent.load(Ordering::Relaxed);
    let bytes_sent = session.bytes_sent.load(Ordering::Relaxed);

    Ok(Json(StreamStats {
        device: session.device_id.clone(),
        codec: params.codec.to_string(),
        pixel_format: session.pixel_format().label(),
        width: params.width,
        height: params.height,
        fps: params.fps,
        bitrate_kbps: params.bitrate_kbps,
        active_clients: session.client_count.load(Ordering::SeqCst),
        fps_out: frames_sent as f64 / uptime,
        bitrate_out_kbps: (bytes_sent as f64 * 8.0 / 1000.0) / uptime,
        frames_sent,
        bytes_sent,
    }))
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub status: &'static str,
}

/// `POST /stream/:device/feedback?type=idr`
pub async fn stream_feedback(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<FeedbackResponse>> {
    let session = state
        .sessions
        .find(&device)
        .ok_or_else(|| AppError::NotFound(format!("device {}", device)))?;
    session.touch();

    match query.get("type").map(String::as_str) {
        Some("idr") => {
            session.idr_requests.fetch_add(1, Ordering::SeqCst);
            Ok(Json(FeedbackResponse {
                status: "idr_requested",
            }))
        }
        other => Err(AppError::BadRequest(format!(
            "unsupported feedback type: {}",
            other.unwrap_or("<missing>")
        ))),
    }
}

/// `GET /stream/live/:device`
pub async fn stream_live(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match live_response(state, device, query).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn live_response(
    state: Arc<AppState>,
    device: String,
    query: HashMap<String, String>,
) -> Result<Response> {
    let requested = CaptureParams::from_query(&query, state.default_codec)?;
    requested.validate()?;

    if requested.codec == Codec::H264 && !responders::H264_AVAILABLE {
        return Err(AppError::H264Unavailable(
            "OpenH264 support not compiled in".into(),
        ));
    }

    let session = state.sessions.get_or_create(&device, &requested);
    let guard = ClientGuard::new(state.sessions.clone(), session.clone());

    // Parameter lock: the canonical codec wins for the session's lifetime.
    let canonical = session.params();
    if requested.codec != canonical.codec {
        let mut actual = canonical;
        actual.container = requested.container;
        let eff = EffectiveParams::new(requested, actual);
        let err = AppError::Conflict("params locked by first requester".into());
        let mut response = (err.status_code(), Json(err.to_body())).into_response();
        insert_effective_params(&mut response, &eff);
        return Ok(response);
    }

    {
        let session = session.clone();
        tokio::task::spawn_blocking(move || session.ensure_started())
            .await
            .map_err(|e| AppError::Internal(format!("capture start task failed: {}", e)))??;
    }

    let mut actual = session.params();
    actual.container = requested.container;
    let eff = EffectiveParams::new(requested.clone(), actual.clone());
    info!(
        "Live stream for {}: {} ({} clients)",
        device,
        eff.header_value(),
        session.client_count.load(Ordering::SeqCst)
    );

    let (content_type, body) = match (actual.codec, actual.container) {
        (Codec::Mjpeg, _) => (
            "multipart/x-mixed-replace; boundary=frame",
            stream_body(guard, actual.clone(), responders::run_mjpeg),
        ),
        (Codec::H264, Container::Raw) => (
            "video/H264",
            stream_body(guard, actual.clone(), responders::run_h264_raw),
        ),
        (Codec::H264, Container::Mp4) => {
            let preflight_session = session.clone();
            let preflight_params = actual.clone();
            tokio::task::spawn_blocking(move || {
                responders::preflight_parameter_sets(&preflight_session, &preflight_params)
            })
            .await
            .map_err(|e| AppError::Internal(format!("preflight task failed: {}", e)))??;

            (
                "video/mp4",
                stream_body(guard, actual.clone(), responders::run_fmp4),
            )
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-store");
    if actual.container == Container::Mp4 {
        builder = builder.header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
    }
    let mut response = builder
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    insert_effective_params(&mut response, &eff);
    Ok(response)
}

fn insert_effective_params(response: &mut Response, eff: &EffectiveParams) {
    if let Ok(value) = HeaderValue::from_str(&eff.header_value()) {
        response.headers_mut().insert(EFFECTIVE_PARAMS_HEADER, value);
    }
}

/// Bridge a blocking stream worker into a chunked response body. The worker
/// owns the client guard; when the body is dropped the channel closes and
/// the worker's next send fails, running the disconnect path.
fn stream_body<F>(guard: ClientGuard, params: CaptureParams, worker: F) -> Body
where
    F: FnOnce(ClientGuard, CaptureParams, mpsc::Sender<Bytes>) + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Bytes>(4);
    tokio::task::spawn_blocking(move || worker(guard, params, tx));

    Body::from_stream(async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<Bytes, std::io::Error>(chunk);
        }
    })
}

#[derive(Debug, Serialize)]
pub struct UdpStartResponse {
    pub status: &'static str,
}

/// `GET /stream/udp/:device`
pub async fn stream_udp(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<UdpStartResponse>> {
    let target = query
        .get("target")
        .ok_or_else(|| AppError::BadRequest("target and port are required".into()))?;
    let port: u16 = query
        .get("port")
        .ok_or_else(|| AppError::BadRequest("target and port are required".into()))?
        .parse()
        .map_err(|_| AppError::BadRequest("invalid port".into()))?;
    let duration: u64 = match query.get("duration") {
        Some(v) => v
            .parse()
            .map_err(|_| AppError::BadRequest("invalid duration".into()))?,
        None => 10,
    };

    // UDP pushes default to H.264 rather than the server-wide codec.
    let params = CaptureParams::from_query(&query, Codec::H264)?;
    params.validate()?;
    if params.codec == Codec::H264 && !responders::H264_AVAILABLE {
        return Err(AppError::H264Unavailable(
            "OpenH264 support not compiled in".into(),
        ));
    }

    // Validate the destination and open the socket before committing the
    // 200 response; there is no way to report errors afterwards.
    let ip: Ipv4Addr = target
        .parse()
        .map_err(|_| AppError::BadRequest(format!("invalid IPv4 target: {}", target)))?;
    let socket = UdpSocket::bind(("0.0.0.0", 0))
        .map_err(|e| AppError::UdpUnavailable(format!("failed to open socket: {}", e)))?;
    socket
        .connect(SocketAddr::from((ip, port)))
        .map_err(|e| AppError::UdpUnavailable(format!("failed to connect socket: {}", e)))?;

    let session = state.sessions.get_or_create(&device, &params);
    let guard = ClientGuard::new(state.sessions.clone(), session.clone());

    let canonical = session.params();
    if params.codec != canonical.codec {
        return Err(AppError::Conflict("params locked by first requester".into()));
    }

    {
        let session = session.clone();
        tokio::task::spawn_blocking(move || session.ensure_started())
            .await
            .map_err(|e| AppError::Internal(format!("capture start task failed: {}", e)))??;
    }

    let actual = session.params();
    info!(
        "UDP stream for {} to {}:{} for {}s",
        device, target, port, duration
    );
    tokio::task::spawn_blocking(move || {
        responders::run_udp(guard, actual, socket, Duration::from_secs(duration))
    });

    Ok(Json(UdpStartResponse {
        status: "udp_stream_started",
    }))
}
