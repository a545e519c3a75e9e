//! # Bids API
//!
//! Placement lives under `/v1/jobs/:id/bids`; these endpoints act on a bid
//! that already exists. Acceptance is a job transition
//! (`POST /v1/jobs/:id/accept`) because it rejects every sibling bid.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use gig_state::Bid;
use uuid::Uuid;

use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/bids/:id", get(get_bid))
        .route("/v1/bids/:id/shortlist", post(shortlist_bid))
        .route("/v1/bids/:id/decline", post(decline_bid))
        .route("/v1/bids/:id/withdraw", post(withdraw_bid))
}

/// GET /v1/bids/:id
#[utoipa::path(
    get,
    path = "/v1/bids/{id}",
    params(("id" = Uuid, Path, description = "Bid ID")),
    responses(
        (status = 200, description = "Bid found", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "bids"
)]
async fn get_bid(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Bid>, AppError> {
    Ok(Json(state.market.bid(id.into())?))
}

/// POST /v1/bids/:id/shortlist: Client marks a bid as a favourite.
#[utoipa::path(
    post,
    path = "/v1/bids/{id}/shortlist",
    params(("id" = Uuid, Path, description = "Bid ID")),
    responses(
        (status = 200, description = "Bid shortlisted", body = serde_json::Value),
        (status = 403, description = "Caller is not the job's client", body = crate::error::ErrorBody),
        (status = 409, description = "Bid is no longer pending", body = crate::error::ErrorBody),
    ),
    tag = "bids"
)]
async fn shortlist_bid(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<Bid>, AppError> {
    Ok(Json(state.market.shortlist_bid(&caller, id.into()).await?))
}

/// POST /v1/bids/:id/decline
#[utoipa::path(
    post,
    path = "/v1/bids/{id}/decline",
    params(("id" = Uuid, Path, description = "Bid ID")),
    responses(
        (status = 200, description = "Bid declined", body = serde_json::Value),
        (status = 403, description = "Caller is not the job's client", body = crate::error::ErrorBody),
        (status = 409, description = "Bid already decided", body = crate::error::ErrorBody),
    ),
    tag = "bids"
)]
async fn decline_bid(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<Bid>, AppError> {
    Ok(Json(state.market.decline_bid(&caller, id.into()).await?))
}

/// POST /v1/bids/:id/withdraw: The bidding freelancer retracts.
#[utoipa::path(
    post,
    path = "/v1/bids/{id}/withdraw",
    params(("id" = Uuid, Path, description = "Bid ID")),
    responses(
        (status = 200, description = "Bid withdrawn", body = serde_json::Value),
        (status = 403, description = "Caller did not place the bid", body = crate::error::ErrorBody),
        (status = 409, description = "Bid already decided", body = crate::error::ErrorBody),
    ),
    tag = "bids"
)]
async fn withdraw_bid(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<Bid>, AppError> {
    Ok(Json(state.market.withdraw_bid(&caller, id.into()).await?))
}
