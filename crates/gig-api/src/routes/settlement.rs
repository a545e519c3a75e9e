//! # Settlement API
//!
//! Callbacks from the settlement rail and operator tooling. Every write
//! here requires system authority. Acknowledgments are idempotent: a
//! repeated ack for a leg answers with the batch's current state and
//! changes nothing.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use gig_escrow::{AckStatus, JournalEntry, SettlementAck};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::extractors::{extract_validated_json, Validate};
use crate::orchestration::settlement::SettlementUpdate;
use crate::state::AppState;

/// Asynchronous acknowledgment of one settlement leg.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct AckRequest {
    /// The leg's idempotency key.
    pub intent_id: Uuid,
    /// `confirmed` or `failed`.
    pub status: String,
    pub settlement_reference: Option<String>,
    /// Required when `status` is `failed`.
    pub reason: Option<String>,
}

impl AckRequest {
    fn ack_status(&self) -> Result<AckStatus, String> {
        match self.status.as_str() {
            "confirmed" => Ok(AckStatus::Confirmed),
            "failed" => Ok(AckStatus::Failed),
            other => Err(format!("status must be confirmed or failed, got {other:?}")),
        }
    }
}

impl Validate for AckRequest {
    fn validate(&self) -> Result<(), String> {
        let status = self.ack_status()?;
        if status == AckStatus::Failed && self.reason.as_deref().map_or(true, |r| r.trim().is_empty()) {
            return Err("a failed acknowledgment must carry a reason".into());
        }
        Ok(())
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/settlement/acks", post(acknowledge))
        .route("/v1/settlement/stalled", get(list_stalled))
        .route("/v1/settlement/intents/:id/retry", post(retry_intent))
        .route("/v1/settlement/batches/:id", get(get_batch))
}

/// POST /v1/settlement/acks: Settlement rail reports a leg's outcome.
#[utoipa::path(
    post,
    path = "/v1/settlement/acks",
    request_body = AckRequest,
    responses(
        (status = 200, description = "Acknowledgment applied or already known", body = serde_json::Value),
        (status = 403, description = "System authority required", body = crate::error::ErrorBody),
        (status = 404, description = "Unknown intent", body = crate::error::ErrorBody),
    ),
    tag = "settlement"
)]
async fn acknowledge(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<AckRequest>, JsonRejection>,
) -> Result<Json<SettlementUpdate>, AppError> {
    let req = extract_validated_json(body)?;
    let status = req.ack_status().map_err(AppError::Validation)?;
    let ack = SettlementAck {
        intent_id: req.intent_id.into(),
        status,
        settlement_reference: req.settlement_reference,
        reason: req.reason,
    };
    Ok(Json(state.market.acknowledge_settlement(&caller, ack).await?))
}

/// GET /v1/settlement/stalled: Legs waiting on an operator.
#[utoipa::path(
    get,
    path = "/v1/settlement/stalled",
    responses(
        (status = 200, description = "Stalled journal entries, oldest first", body = serde_json::Value),
        (status = 403, description = "System authority required", body = crate::error::ErrorBody),
    ),
    tag = "settlement"
)]
async fn list_stalled(
    State(state): State<AppState>,
    caller: CallerIdentity,
) -> Result<Json<Vec<JournalEntry>>, AppError> {
    caller.require_system()?;
    Ok(Json(state.market.stalled_intents()))
}

/// POST /v1/settlement/intents/:id/retry: Re-dispatch a stalled leg.
#[utoipa::path(
    post,
    path = "/v1/settlement/intents/{id}/retry",
    params(("id" = Uuid, Path, description = "Intent ID")),
    responses(
        (status = 200, description = "Leg re-dispatched", body = serde_json::Value),
        (status = 403, description = "System authority required", body = crate::error::ErrorBody),
        (status = 409, description = "Leg is not stalled", body = crate::error::ErrorBody),
    ),
    tag = "settlement"
)]
async fn retry_intent(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<SettlementUpdate>, AppError> {
    Ok(Json(state.market.retry_stalled(&caller, id.into()).await?))
}

/// GET /v1/settlement/batches/:id: Every journaled leg of a batch.
#[utoipa::path(
    get,
    path = "/v1/settlement/batches/{id}",
    params(("id" = Uuid, Path, description = "Batch ID")),
    responses(
        (status = 200, description = "Batch legs", body = serde_json::Value),
        (status = 404, description = "Unknown batch", body = crate::error::ErrorBody),
    ),
    tag = "settlement"
)]
async fn get_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<JournalEntry>>, AppError> {
    Ok(Json(state.market.settlement_batch(id.into())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(status: &str, reason: Option<&str>) -> AckRequest {
        AckRequest {
            intent_id: Uuid::new_v4(),
            status: status.into(),
            settlement_reference: None,
            reason: reason.map(String::from),
        }
    }

    #[test]
    fn failed_acks_need_a_reason() {
        assert!(ack("confirmed", None).validate().is_ok());
        assert!(ack("failed", None).validate().is_err());
        assert!(ack("failed", Some("insufficient funds")).validate().is_ok());
        assert!(ack("pending", None).validate().is_err());
    }
}
