//! # Disputes API
//!
//! The arbiter queue. Disputes are raised under
//! `/v1/milestones/:id/disputes`; these endpoints list, claim and close
//! them. A ruling is handed to escrow as a new settlement batch.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use gig_arbitration::{Dispute, ResolutionAction};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::parse_amount;
use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::extractors::{extract_query, extract_validated_json, require_text, Validate};
use crate::state::AppState;

/// Listing filter.
#[derive(Debug, Default, Deserialize)]
pub struct DisputeQuery {
    /// Only disputes still pending or under review.
    #[serde(default)]
    pub open: bool,
}

/// An arbiter's ruling.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ResolveRequest {
    /// `release_to_freelancer`, `refund_to_client` or `split`.
    pub action: String,
    /// Freelancer share for `split`, as a decimal string.
    pub freelancer_amount: Option<String>,
    /// Client share for `split`, as a decimal string.
    pub client_amount: Option<String>,
    #[serde(default)]
    pub note: String,
}

impl ResolveRequest {
    fn action(&self) -> Result<ResolutionAction, String> {
        match self.action.as_str() {
            "release_to_freelancer" => Ok(ResolutionAction::ReleaseToFreelancer),
            "refund_to_client" => Ok(ResolutionAction::RefundToClient),
            "split" => {
                let (Some(freelancer), Some(client)) = (&self.freelancer_amount, &self.client_amount) else {
                    return Err("split requires freelancer_amount and client_amount".into());
                };
                Ok(ResolutionAction::Split {
                    freelancer: parse_amount("freelancer_amount", freelancer)?,
                    client: parse_amount("client_amount", client)?,
                })
            }
            other => Err(format!("unknown resolution action {other:?}")),
        }
    }
}

impl Validate for ResolveRequest {
    fn validate(&self) -> Result<(), String> {
        self.action().map(drop)
    }
}

/// Close a dispute without a ruling.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct DismissRequest {
    pub reason: String,
}

impl Validate for DismissRequest {
    fn validate(&self) -> Result<(), String> {
        require_text("reason", &self.reason)
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/disputes", get(list_disputes))
        .route("/v1/disputes/overdue", get(overdue_disputes))
        .route("/v1/disputes/:id", get(get_dispute))
        .route("/v1/disputes/:id/claim", post(claim_dispute))
        .route("/v1/disputes/:id/resolve", post(resolve_dispute))
        .route("/v1/disputes/:id/dismiss", post(dismiss_dispute))
}

/// GET /v1/disputes: Disputes oldest first.
#[utoipa::path(
    get,
    path = "/v1/disputes",
    params(("open" = Option<bool>, Query, description = "Only open disputes")),
    responses(
        (status = 200, description = "Disputes", body = serde_json::Value),
    ),
    tag = "disputes"
)]
async fn list_disputes(
    State(state): State<AppState>,
    query: Result<Query<DisputeQuery>, QueryRejection>,
) -> Result<Json<Vec<Dispute>>, AppError> {
    let query = extract_query(query)?;
    Ok(Json(state.market.list_disputes(query.open)))
}

/// GET /v1/disputes/overdue: Open disputes past the resolution SLA.
#[utoipa::path(
    get,
    path = "/v1/disputes/overdue",
    responses(
        (status = 200, description = "Overdue disputes", body = serde_json::Value),
    ),
    tag = "disputes"
)]
async fn overdue_disputes(State(state): State<AppState>) -> Json<Vec<Dispute>> {
    Json(state.market.overdue_disputes(Utc::now()))
}

/// GET /v1/disputes/:id
#[utoipa::path(
    get,
    path = "/v1/disputes/{id}",
    params(("id" = Uuid, Path, description = "Dispute ID")),
    responses(
        (status = 200, description = "Dispute found", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "disputes"
)]
async fn get_dispute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Dispute>, AppError> {
    Ok(Json(state.market.dispute(id.into())?))
}

/// POST /v1/disputes/:id/claim: Arbiter takes the dispute.
#[utoipa::path(
    post,
    path = "/v1/disputes/{id}/claim",
    params(("id" = Uuid, Path, description = "Dispute ID")),
    responses(
        (status = 200, description = "Dispute under review", body = serde_json::Value),
        (status = 403, description = "Caller is not an arbiter", body = crate::error::ErrorBody),
        (status = 409, description = "Already claimed or closed", body = crate::error::ErrorBody),
    ),
    tag = "disputes"
)]
async fn claim_dispute(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<Dispute>, AppError> {
    Ok(Json(state.market.claim_dispute(&caller, id.into()).await?))
}

/// POST /v1/disputes/:id/resolve: Arbiter rules on the disputed funds.
#[utoipa::path(
    post,
    path = "/v1/disputes/{id}/resolve",
    params(("id" = Uuid, Path, description = "Dispute ID")),
    request_body = ResolveRequest,
    responses(
        (status = 200, description = "Dispute resolved", body = serde_json::Value),
        (status = 403, description = "Caller is not an arbiter", body = crate::error::ErrorBody),
        (status = 409, description = "Dispute already closed", body = crate::error::ErrorBody),
        (status = 422, description = "Split does not sum to the disputed amount", body = crate::error::ErrorBody),
    ),
    tag = "disputes"
)]
async fn resolve_dispute(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<Dispute>, AppError> {
    let req = extract_validated_json(body)?;
    let action = req.action().map_err(AppError::Validation)?;
    let dispute = state
        .market
        .resolve_dispute(&caller, id.into(), action, req.note)
        .await?;
    Ok(Json(dispute))
}

/// POST /v1/disputes/:id/dismiss: Close without a ruling.
#[utoipa::path(
    post,
    path = "/v1/disputes/{id}/dismiss",
    params(("id" = Uuid, Path, description = "Dispute ID")),
    request_body = DismissRequest,
    responses(
        (status = 200, description = "Dispute dismissed, milestone restored", body = serde_json::Value),
        (status = 403, description = "Caller is not an arbiter", body = crate::error::ErrorBody),
        (status = 409, description = "Dispute already closed", body = crate::error::ErrorBody),
    ),
    tag = "disputes"
)]
async fn dismiss_dispute(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<DismissRequest>, JsonRejection>,
) -> Result<Json<Dispute>, AppError> {
    let req = extract_validated_json(body)?;
    Ok(Json(state.market.dismiss_dispute(&caller, id.into(), req.reason).await?))
}
