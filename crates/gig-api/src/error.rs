//! # API Error Types
//!
//! Structured error type implementing `axum::response::IntoResponse`.
//! Domain [`Rejection`]s keep their stable reason code on the wire; every
//! other failure maps to one of the transport-level variants. Internal
//! details are logged, never returned.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gig_core::{Rejection, RejectionCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Structured JSON error response body.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// Inner error detail.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable code, e.g. `INVALID_TRANSITION` or `CONFLICT`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured context for client errors. Omitted for 500s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Application-level error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// A domain operation refused the request.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    /// Resource not found (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Request validation failed (422).
    #[error("validation error: {0}")]
    Validation(String),

    /// Request body could not be parsed (400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or invalid credentials (401).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Insufficient authority (403).
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Conflict with current resource state (409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal server error (500). Message is logged but not returned.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status and machine-readable code.
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Rejected(r) => {
                let code = r.code();
                let status = match code {
                    RejectionCode::InvalidTransition | RejectionCode::Conflict => StatusCode::CONFLICT,
                    RejectionCode::Forbidden => StatusCode::FORBIDDEN,
                    RejectionCode::ValidationFailed => StatusCode::UNPROCESSABLE_ENTITY,
                    RejectionCode::SettlementFailed => StatusCode::BAD_GATEWAY,
                    RejectionCode::NotFound => StatusCode::NOT_FOUND,
                };
                (status, code.as_str())
            }
            Self::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_FAILED"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            Self::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    /// Machine-readable code, also used as the metrics outcome label.
    pub fn code(&self) -> &'static str {
        self.status_and_code().1
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Rejected(Rejection::InvalidTransition {
                entity,
                from,
                action,
                ..
            }) => Some(serde_json::json!({
                "entity": entity,
                "from": from,
                "action": action,
            })),
            Self::Rejected(Rejection::Conflict {
                entity,
                id,
                expected,
                actual,
            }) => Some(serde_json::json!({
                "entity": entity,
                "id": id,
                "expected_version": expected,
                "actual_version": actual,
            })),
            Self::Rejected(Rejection::SettlementFailed { intent_id, .. }) => {
                Some(serde_json::json!({ "intent_id": intent_id }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match &self {
            Self::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        };

        if matches!(&self, Self::Internal(_)) {
            tracing::error!(error = %self, "internal server error");
        }

        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
                details: self.details(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<gig_escrow::EscrowError> for AppError {
    fn from(err: gig_escrow::EscrowError) -> Self {
        Self::Rejected(err.into())
    }
}

impl From<gig_arbitration::DisputeError> for AppError {
    fn from(err: gig_arbitration::DisputeError) -> Self {
        Self::Rejected(err.into())
    }
}

impl From<gig_presence::PresenceError> for AppError {
    fn from(err: gig_presence::PresenceError) -> Self {
        Self::Rejected(err.into())
    }
}

impl From<gig_reputation::ReputationError> for AppError {
    fn from(err: gig_reputation::ReputationError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(format!("database: {err}"))
    }
}
