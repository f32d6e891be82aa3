//! JSON response envelopes.

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Body of every response produced by an [`EndpointHandler`](super::EndpointHandler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub request_id: String,
    pub status_code: u16,
    pub status_text: String,
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn success(request_id: impl Into<String>, data: T) -> Self {
        Self {
            request_id: request_id.into(),
            status_code: StatusCode::OK.as_u16(),
            status_text: "success".to_string(),
            data: Some(data),
            error: None,
        }
    }

    /// Failure envelope. Only [`Error::client_message`] reaches the body.
    pub fn failure(request_id: impl Into<String>, err: &Error) -> Self {
        let status = err.status_code();
        Self {
            request_id: request_id.into(),
            status_code: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            data: None,
            error: Some(err.client_message()),
        }
    }
}

pub fn success_response<T: Serialize>(request_id: &str, data: T) -> Response {
    (StatusCode::OK, Json(Envelope::success(request_id, data))).into_response()
}

pub fn error_response(request_id: &str, err: &Error) -> Response {
    (
        err.status_code(),
        Json(Envelope::<()>::failure(request_id, err)),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        error_response("", &self)
    }
}
