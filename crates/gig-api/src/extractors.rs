//! # Request Extraction & Validation
//!
//! Handlers take `Result<Json<T>, JsonRejection>` and pass it through
//! [`extract_json`] or [`extract_validated_json`] so malformed bodies come
//! back as structured `BAD_REQUEST` errors instead of axum's plain text.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::Query;
use axum::Json;

use crate::error::AppError;

/// Request DTOs with rules beyond what serde checks.
pub trait Validate {
    /// Returns a message describing the first violated rule.
    fn validate(&self) -> Result<(), String>;
}

/// Unwrap a JSON body, mapping deserialization errors to [`AppError::BadRequest`].
pub fn extract_json<T>(result: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    result
        .map(|Json(v)| v)
        .map_err(|err| AppError::BadRequest(err.body_text()))
}

/// Unwrap and validate a JSON body.
pub fn extract_validated_json<T: Validate>(
    result: Result<Json<T>, JsonRejection>,
) -> Result<T, AppError> {
    let value = extract_json(result)?;
    value.validate().map_err(AppError::Validation)?;
    Ok(value)
}

/// Unwrap a query string, mapping parse errors to [`AppError::BadRequest`].
pub fn extract_query<T>(result: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    result
        .map(|Query(v)| v)
        .map_err(|err| AppError::BadRequest(err.body_text()))
}

/// Reject blank required text fields.
pub fn require_text(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} must not be empty"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Note(String);

    impl Validate for Note {
        fn validate(&self) -> Result<(), String> {
            require_text("note", &self.0)
        }
    }

    #[test]
    fn validated_body_surfaces_rule_violations() {
        let ok = extract_validated_json::<Note>(Ok(Json(Note("fine".into()))));
        assert!(ok.is_ok());
        let err = extract_validated_json::<Note>(Ok(Json(Note("  ".into())))).unwrap_err();
        assert!(matches!(err, AppError::Validation(m) if m == "note must not be empty"));
    }
}
