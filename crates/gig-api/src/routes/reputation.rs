//! # Reputation API
//!
//! Per-role reputation records, reviews received, resync and the daily
//! decay pass. Records are derived data: a resync recomputes them from the
//! job, bid, dispute and review history.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use gig_reputation::{DecayReport, IntegrityReport, SyncReport};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::orchestration::reviews::ReputationProfile;
use crate::records::Review;
use crate::state::AppState;

/// Decay pass parameters.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct DecayRequest {
    /// Evaluate inactivity as of this instant (default: now).
    pub as_of: Option<DateTime<Utc>>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/users/:id/reputation", get(get_reputation))
        .route("/v1/users/:id/reputation/sync", post(sync_reputation))
        .route("/v1/users/:id/reputation/verify", get(verify_reputation))
        .route("/v1/users/:id/reviews", get(list_reviews))
        .route("/v1/reputation/decay", post(apply_decay))
}

/// GET /v1/users/:id/reputation: Freelancer and client records.
#[utoipa::path(
    get,
    path = "/v1/users/{id}/reputation",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Reputation profile", body = serde_json::Value),
    ),
    tag = "reputation"
)]
async fn get_reputation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReputationProfile>, AppError> {
    Ok(Json(state.market.reputation_of(id.into())?))
}

/// POST /v1/users/:id/reputation/sync: Recompute from history.
#[utoipa::path(
    post,
    path = "/v1/users/{id}/reputation/sync",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Records recomputed", body = serde_json::Value),
        (status = 403, description = "Only the user or the system may resync", body = crate::error::ErrorBody),
    ),
    tag = "reputation"
)]
async fn sync_reputation(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncReport>, AppError> {
    Ok(Json(state.market.sync_reputation(&caller, id.into()).await?))
}

/// GET /v1/users/:id/reputation/verify: Compare stored and fresh records.
#[utoipa::path(
    get,
    path = "/v1/users/{id}/reputation/verify",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Integrity report", body = serde_json::Value),
    ),
    tag = "reputation"
)]
async fn verify_reputation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<IntegrityReport>, AppError> {
    Ok(Json(state.market.verify_reputation(id.into())?))
}

/// GET /v1/users/:id/reviews: Reviews received, newest first.
#[utoipa::path(
    get,
    path = "/v1/users/{id}/reviews",
    params(("id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "Reviews", body = serde_json::Value),
    ),
    tag = "reputation"
)]
async fn list_reviews(State(state): State<AppState>, Path(id): Path<Uuid>) -> Json<Vec<Review>> {
    Json(state.market.reviews_for(id.into()))
}

/// POST /v1/reputation/decay: Apply inactivity decay. Idempotent per day.
#[utoipa::path(
    post,
    path = "/v1/reputation/decay",
    request_body = DecayRequest,
    responses(
        (status = 200, description = "Decay pass summary", body = serde_json::Value),
        (status = 403, description = "System authority required", body = crate::error::ErrorBody),
    ),
    tag = "reputation"
)]
async fn apply_decay(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Option<Json<DecayRequest>>,
) -> Result<Json<DecayReport>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let as_of = req.as_of.unwrap_or_else(Utc::now);
    Ok(Json(state.market.apply_decay(&caller, as_of).await?))
}
