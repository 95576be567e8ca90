//! HTTP error surface
//!
//! Every failure leaves the server as `{code, message}` with the matching
//! status; the `code` strings are part of the public contract.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use via_core::error::{ControlError, ErrorCode, ViaError};

use crate::ingest::IngestError;

/// An error ready to be serialized to a client.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::BadEvent | ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::EmbedderBusy | ErrorCode::BackendUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorCode::PartitionTimeout
            | ErrorCode::PromotionDegraded
            | ErrorCode::InvariantViolation
            | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.code,
            "message": self.message,
        }));
        (self.status(), body).into_response()
    }
}

impl From<ViaError> for ApiError {
    fn from(err: ViaError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self::from(ViaError::from(err))
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Overloaded => Self::new(ErrorCode::Overloaded, err.to_string()),
            IngestError::EmbedderBusy => Self::new(ErrorCode::EmbedderBusy, err.to_string()),
            IngestError::Internal(inner) => Self::from(inner),
        }
    }
}
