//! The §6/§7 error body shape and the translation from `HapaxError` into an
//! HTTP response: `{type, message, request_id, details?}` with the status
//! code implied by the error's kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use hapax_core::HapaxError;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            request_id: request_id.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Map a `HapaxError` to its §6 HTTP status and error body.
pub fn status_for(err: &HapaxError) -> StatusCode {
    match err {
        HapaxError::Validation(_) => StatusCode::BAD_REQUEST,
        HapaxError::Authentication(_) => StatusCode::UNAUTHORIZED,
        HapaxError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
        HapaxError::Replay => StatusCode::TOO_EARLY,
        HapaxError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        HapaxError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        HapaxError::Provider(_) | HapaxError::CircuitOpen => StatusCode::INTERNAL_SERVER_ERROR,
        HapaxError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        HapaxError::Internal(_)
        | HapaxError::Config(_)
        | HapaxError::Io(_)
        | HapaxError::Serialization(_)
        | HapaxError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Render a `HapaxError` as the §6 JSON error body with its request ID.
pub struct ApiError {
    pub error: HapaxError,
    pub request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        let body = ErrorBody::new(self.error.kind(), self.error.to_string(), self.request_id);
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_maps_to_503() {
        assert_eq!(status_for(&HapaxError::QueueFull), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn timeout_maps_to_504() {
        assert_eq!(status_for(&HapaxError::Timeout), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn replay_maps_to_425() {
        assert_eq!(status_for(&HapaxError::Replay), StatusCode::TOO_EARLY);
    }

    #[test]
    fn error_body_serializes_type_field_not_kind() {
        let body = ErrorBody::new("validation", "bad request", "abc-123");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "validation");
        assert_eq!(json["request_id"], "abc-123");
    }
}
