use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capability probe failed: {0}")]
    CapsUnavailable(String),

    #[error("H.264 unavailable: {0}")]
    H264Unavailable(String),

    #[error("fMP4 unavailable: {0}")]
    Fmp4Unavailable(String),

    #[error("UDP unavailable: {0}")]
    UdpUnavailable(String),

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body: `{"error":"<kind>","details":"..."}`
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AppError {
    /// The short kind reported in the JSON `error` field.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::DeviceUnavailable(_) => "device_unavailable",
            AppError::CapsUnavailable(_) => "caps_unavailable",
            AppError::H264Unavailable(_) => "h264_unavailable",
            AppError::Fmp4Unavailable(_) => "fmp4_unavailable",
            AppError::UdpUnavailable(_) => "udp_unavailable",
            AppError::VideoError(_)
            | AppError::Io(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::DeviceUnavailable(_)
            | AppError::CapsUnavailable(_)
            | AppError::H264Unavailable(_)
            | AppError::Fmp4Unavailable(_)
            | AppError::UdpUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::VideoError(_)
            | AppError::Io(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<String> {
        let details = match self {
            AppError::BadRequest(d)
            | AppError::NotFound(d)
            | AppError::Conflict(d)
            | AppError::DeviceUnavailable(d)
            | AppError::CapsUnavailable(d)
            | AppError::H264Unavailable(d)
            | AppError::Fmp4Unavailable(d)
            | AppError::UdpUnavailable(d)
            | AppError::VideoError(d)
            | AppError::Internal(d) => d.clone(),
            AppError::Io(e) => e.to_string(),
            AppError::Serialization(e) => e.to_string(),
        };
        if details.is_empty() {
            None
        } else {
            Some(details)
        }
    }

    pub fn to_body(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.kind(),
            details: self.details(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_body();

        tracing::error!(
            error_kind = body.error,
            error_message = %self,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_status_mapping() {
        let cases = [
            (AppError::BadRequest("x".into()), "bad_request", 400u16),
            (AppError::NotFound("x".into()), "not_found", 404),
            (AppError::Conflict("x".into()), "conflict", 409),
            (
                AppError::DeviceUnavailable("x".into()),
                "device_unavailable",
                503,
            ),
            (AppError::CapsUnavailable("x".into()), "caps_unavailable", 503),
            (AppError::H264Unavailable("x".into()), "h264_unavailable", 503),
            (AppError::Fmp4Unavailable("x".into()), "fmp4_unavailable", 503),
            (AppError::UdpUnavailable("x".into()), "udp_unavailable", 503),
        ];
        for (err, kind, status) in cases {
            assert_eq!(err.kind(), kind);
            assert_eq!(err.status_code().as_u16(), status);
        }
    }

    #[test]
    fn test_error_body_json() {
        let err = AppError::Conflict("params locked by first requester".into());
        let json = serde_json::to_string(&err.to_body()).unwrap();
        assert_eq!(
            json,
            r#"{"error":"conflict","details":"params locked by first requester"}"#
        );
    }

    #[test]
    fn test_empty_details_omitted() {
        let err = AppError::NotFound(String::new());
        let json = serde_json::to_string(&err.to_body()).unwrap();
        assert_eq!(json, r#"{"error":"not_found"}"#);
    }
}
