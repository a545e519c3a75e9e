//! # Workspace API
//!
//! Presence in a job's shared workspace. Sessions live in memory only and
//! lapse when heartbeats stop.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use gig_presence::WorkspaceSession;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::state::AppState;

/// Heartbeat payload.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatRequest {
    /// Tab the user is looking at, e.g. `files` or `chat`.
    pub active_tab: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/jobs/:id/workspace", get(list_participants).post(join))
        .route("/v1/workspace/sessions/:id/heartbeat", post(heartbeat))
        .route("/v1/workspace/sessions/:id/leave", post(leave))
}

/// POST /v1/jobs/:id/workspace: Join, or rejoin, a job's workspace.
#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/workspace",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Session", body = serde_json::Value),
        (status = 403, description = "Caller is not a party or arbiter", body = crate::error::ErrorBody),
    ),
    tag = "workspace"
)]
async fn join(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkspaceSession>, AppError> {
    Ok(Json(state.market.join_workspace(&caller, id.into())?))
}

/// GET /v1/jobs/:id/workspace: Active participants.
#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/workspace",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Active sessions", body = serde_json::Value),
        (status = 403, description = "Caller is not a party or arbiter", body = crate::error::ErrorBody),
    ),
    tag = "workspace"
)]
async fn list_participants(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<WorkspaceSession>>, AppError> {
    Ok(Json(state.market.workspace_participants(&caller, id.into())?))
}

/// POST /v1/workspace/sessions/:id/heartbeat
#[utoipa::path(
    post,
    path = "/v1/workspace/sessions/{id}/heartbeat",
    params(("id" = Uuid, Path, description = "Session ID")),
    request_body = HeartbeatRequest,
    responses(
        (status = 200, description = "Session refreshed", body = serde_json::Value),
        (status = 403, description = "Session belongs to another user", body = crate::error::ErrorBody),
        (status = 404, description = "Session expired or unknown", body = crate::error::ErrorBody),
    ),
    tag = "workspace"
)]
async fn heartbeat(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<Json<WorkspaceSession>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(state.market.heartbeat_workspace(&caller, id.into(), req.active_tab)?))
}

/// POST /v1/workspace/sessions/:id/leave
#[utoipa::path(
    post,
    path = "/v1/workspace/sessions/{id}/leave",
    params(("id" = Uuid, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session disconnected", body = serde_json::Value),
        (status = 403, description = "Session belongs to another user", body = crate::error::ErrorBody),
    ),
    tag = "workspace"
)]
async fn leave(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<Json<WorkspaceSession>, AppError> {
    Ok(Json(state.market.leave_workspace(&caller, id.into())?))
}
