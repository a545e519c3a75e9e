//! # Milestones API
//!
//! The escrow lifecycle of one milestone: fund, start, submit, then approve
//! or reject. Funding and approval move money; the response carries
//! `pending_batch` while the settlement is still in flight. A party may
//! dispute a submitted or approved milestone from here as well.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use gig_arbitration::Dispute;
use gig_state::{DeliveryPackage, FileEntry, Milestone};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{expected, VersionGuard};
use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::extractors::{extract_validated_json, require_text, Validate};
use crate::orchestration::milestones::Submission;
use crate::state::AppState;

/// Most files accepted in one delivery package.
const MAX_FILES: usize = 100;

/// One file of a delivery package.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct FileInput {
    pub name: String,
    /// Object key or URL where the content lives.
    pub content_ref: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the content.
    pub sha256: Option<String>,
}

/// Work handed in for review. Either `files` or `reference` must be given.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct SubmitRequest {
    /// Link to the artifact when no files are attached.
    pub reference: Option<String>,
    #[serde(default)]
    pub files: Vec<FileInput>,
    #[serde(default)]
    pub note: String,
    pub expected_version: Option<u64>,
}

impl Validate for SubmitRequest {
    fn validate(&self) -> Result<(), String> {
        if self.files.is_empty() {
            let reference = self.reference.as_deref().unwrap_or_default();
            return require_text("reference", reference);
        }
        if self.files.len() > MAX_FILES {
            return Err(format!("at most {MAX_FILES} files per delivery, got {}", self.files.len()));
        }
        for (i, f) in self.files.iter().enumerate() {
            require_text(&format!("files[{i}].name"), &f.name)?;
            require_text(&format!("files[{i}].content_ref"), &f.content_ref)?;
            if let Some(digest) = &f.sha256 {
                if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(format!("files[{i}].sha256 must be 64 hex characters"));
                }
            }
        }
        Ok(())
    }
}

impl SubmitRequest {
    fn into_submission(self) -> Submission {
        Submission {
            reference: self.reference,
            files: self
                .files
                .into_iter()
                .map(|f| FileEntry {
                    name: f.name,
                    content_ref: f.content_ref,
                    size_bytes: f.size_bytes,
                    sha256: f.sha256.map(|d| d.to_ascii_lowercase()),
                })
                .collect(),
            note: self.note,
        }
    }
}

/// Client accepts the submitted work.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ApproveRequest {
    pub note: Option<String>,
    pub expected_version: Option<u64>,
}

/// Client sends the work back.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct RejectRequest {
    pub feedback: String,
    pub expected_version: Option<u64>,
}

impl Validate for RejectRequest {
    fn validate(&self) -> Result<(), String> {
        require_text("feedback", &self.feedback)
    }
}

/// A party contests the milestone.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct RaiseDisputeRequest {
    pub reason: String,
}

impl Validate for RaiseDisputeRequest {
    fn validate(&self) -> Result<(), String> {
        require_text("reason", &self.reason)
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/milestones/:id", get(get_milestone))
        .route("/v1/milestones/:id/fund", post(fund_milestone))
        .route("/v1/milestones/:id/start", post(start_milestone))
        .route("/v1/milestones/:id/submit", post(submit_milestone))
        .route("/v1/milestones/:id/approve", post(approve_milestone))
        .route("/v1/milestones/:id/reject", post(reject_milestone))
        .route("/v1/milestones/:id/deliveries", get(list_deliveries))
        .route("/v1/milestones/:id/disputes", post(raise_dispute))
}

/// GET /v1/milestones/:id
#[utoipa::path(
    get,
    path = "/v1/milestones/{id}",
    params(("id" = Uuid, Path, description = "Milestone ID")),
    responses(
        (status = 200, description = "Milestone found", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "milestones"
)]
async fn get_milestone(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Milestone>, AppError> {
    Ok(Json(state.market.milestone(id.into())?))
}

/// POST /v1/milestones/:id/fund: Client deposits into escrow.
#[utoipa::path(
    post,
    path = "/v1/milestones/{id}/fund",
    params(("id" = Uuid, Path, description = "Milestone ID")),
    request_body = VersionGuard,
    responses(
        (status = 200, description = "Milestone funded or funding in flight", body = serde_json::Value),
        (status = 403, description = "Caller is not the client", body = crate::error::ErrorBody),
        (status = 409, description = "Invalid transition or stale version", body = crate::error::ErrorBody),
        (status = 502, description = "Settlement rail refused the deposit", body = crate::error::ErrorBody),
    ),
    tag = "milestones"
)]
async fn fund_milestone(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    guard: Option<Json<VersionGuard>>,
) -> Result<Json<Milestone>, AppError> {
    Ok(Json(state.market.fund_milestone(&caller, id.into(), expected(guard)).await?))
}

/// POST /v1/milestones/:id/start: Freelancer begins work.
#[utoipa::path(
    post,
    path = "/v1/milestones/{id}/start",
    params(("id" = Uuid, Path, description = "Milestone ID")),
    request_body = VersionGuard,
    responses(
        (status = 200, description = "Milestone started", body = serde_json::Value),
        (status = 403, description = "Caller is not the freelancer", body = crate::error::ErrorBody),
        (status = 409, description = "Not funded yet or stale version", body = crate::error::ErrorBody),
    ),
    tag = "milestones"
)]
async fn start_milestone(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    guard: Option<Json<VersionGuard>>,
) -> Result<Json<Milestone>, AppError> {
    Ok(Json(state.market.start_milestone(&caller, id.into(), expected(guard)).await?))
}

/// POST /v1/milestones/:id/submit: Freelancer hands in work.
#[utoipa::path(
    post,
    path = "/v1/milestones/{id}/submit",
    params(("id" = Uuid, Path, description = "Milestone ID")),
    request_body = SubmitRequest,
    responses(
        (status = 200, description = "Work submitted", body = serde_json::Value),
        (status = 409, description = "Invalid transition or stale version", body = crate::error::ErrorBody),
        (status = 422, description = "Invalid delivery manifest", body = crate::error::ErrorBody),
    ),
    tag = "milestones"
)]
async fn submit_milestone(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<Milestone>, AppError> {
    let req = extract_validated_json(body)?;
    let version = req.expected_version;
    let milestone = state
        .market
        .submit_milestone(&caller, id.into(), req.into_submission(), version)
        .await?;
    Ok(Json(milestone))
}

/// POST /v1/milestones/:id/approve: Client accepts; funds are released.
#[utoipa::path(
    post,
    path = "/v1/milestones/{id}/approve",
    params(("id" = Uuid, Path, description = "Milestone ID")),
    request_body = ApproveRequest,
    responses(
        (status = 200, description = "Approved; completed once the release settles", body = serde_json::Value),
        (status = 403, description = "Caller is not the client", body = crate::error::ErrorBody),
        (status = 409, description = "Invalid transition, open dispute or stale version", body = crate::error::ErrorBody),
    ),
    tag = "milestones"
)]
async fn approve_milestone(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Option<Json<ApproveRequest>>,
) -> Result<Json<Milestone>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let milestone = state
        .market
        .approve_milestone(&caller, id.into(), req.note, req.expected_version)
        .await?;
    Ok(Json(milestone))
}

/// POST /v1/milestones/:id/reject: Client requests changes.
#[utoipa::path(
    post,
    path = "/v1/milestones/{id}/reject",
    params(("id" = Uuid, Path, description = "Milestone ID")),
    request_body = RejectRequest,
    responses(
        (status = 200, description = "Returned to the freelancer", body = serde_json::Value),
        (status = 409, description = "Invalid transition, rejection limit or stale version", body = crate::error::ErrorBody),
    ),
    tag = "milestones"
)]
async fn reject_milestone(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<RejectRequest>, JsonRejection>,
) -> Result<Json<Milestone>, AppError> {
    let req = extract_validated_json(body)?;
    let milestone = state
        .market
        .reject_milestone(&caller, id.into(), req.feedback, req.expected_version)
        .await?;
    Ok(Json(milestone))
}

/// GET /v1/milestones/:id/deliveries
#[utoipa::path(
    get,
    path = "/v1/milestones/{id}/deliveries",
    params(("id" = Uuid, Path, description = "Milestone ID")),
    responses(
        (status = 200, description = "Delivery packages, oldest first", body = serde_json::Value),
        (status = 404, description = "Milestone not found", body = crate::error::ErrorBody),
    ),
    tag = "milestones"
)]
async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DeliveryPackage>>, AppError> {
    Ok(Json(state.market.deliveries_for(id.into())?))
}

/// POST /v1/milestones/:id/disputes: Client or freelancer raises a dispute.
#[utoipa::path(
    post,
    path = "/v1/milestones/{id}/disputes",
    params(("id" = Uuid, Path, description = "Milestone ID")),
    request_body = RaiseDisputeRequest,
    responses(
        (status = 201, description = "Dispute raised", body = serde_json::Value),
        (status = 403, description = "Caller is not a party to the job", body = crate::error::ErrorBody),
        (status = 409, description = "Milestone cannot be disputed", body = crate::error::ErrorBody),
    ),
    tag = "disputes"
)]
async fn raise_dispute(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<RaiseDisputeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Dispute>), AppError> {
    let req = extract_validated_json(body)?;
    let dispute = state.market.raise_dispute(&caller, id.into(), req.reason).await?;
    Ok((StatusCode::CREATED, Json(dispute)))
}
