//! # Admin API
//!
//! On-demand deadline sweep. The server also runs it on a timer; both paths
//! share [`Marketplace::sweep_expired`](crate::orchestration::Marketplace::sweep_expired),
//! which cancels each expired entity at most once.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::orchestration::SweepReport;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct SweepRequest {
    /// Treat this instant as "now" (default: the current time).
    pub as_of: Option<DateTime<Utc>>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/admin/sweep", post(sweep))
}

/// POST /v1/admin/sweep: Cancel work whose deadlines passed.
#[utoipa::path(
    post,
    path = "/v1/admin/sweep",
    request_body = SweepRequest,
    responses(
        (status = 200, description = "What the sweep cancelled", body = serde_json::Value),
        (status = 403, description = "System authority required", body = crate::error::ErrorBody),
    ),
    tag = "admin"
)]
async fn sweep(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Option<Json<SweepRequest>>,
) -> Result<Json<SweepReport>, AppError> {
    caller.require_system()?;
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let report = state.market.sweep_expired(req.as_of.unwrap_or_else(Utc::now)).await;
    Ok(Json(report))
}
