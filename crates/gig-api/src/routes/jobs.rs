//! # Jobs API
//!
//! Job postings and everything nested under a job: bids, milestones,
//! invoices and reviews. Assignment happens by accepting a bid; the job
//! then moves through `in_progress` to `completed` as its milestones settle,
//! or to `cancelled` with every held milestone refunded.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use gig_state::{Bid, BudgetBounds, Job, Milestone, NewBid, NewJob, NewMilestone};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{expected, parse_amount, VersionGuard};
use crate::auth::CallerIdentity;
use crate::error::AppError;
use crate::extractors::{extract_json, extract_query, extract_validated_json, require_text, Validate};
use crate::records::{Invoice, JobFilter, Review};
use crate::state::AppState;

// ── Request DTOs ────────────────────────────────────────────────────────

/// Request to post a job.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateJobRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    /// Lowest acceptable bid, as a decimal string.
    pub budget_min: String,
    /// Highest acceptable bid, as a decimal string.
    pub budget_max: String,
    /// ISO 4217 code (default `USD`).
    pub currency: Option<String>,
    /// Open jobs are cancelled by the sweep once this passes.
    pub bidding_closes_at: Option<DateTime<Utc>>,
}

impl Validate for CreateJobRequest {
    fn validate(&self) -> Result<(), String> {
        require_text("title", &self.title)?;
        require_text("category", &self.category)?;
        if self.title.len() > 200 {
            return Err("title must be at most 200 characters".into());
        }
        parse_amount("budget_min", &self.budget_min)?;
        parse_amount("budget_max", &self.budget_max)?;
        if let Some(c) = &self.currency {
            if c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_uppercase()) {
                return Err(format!("currency must be a 3-letter ISO 4217 code, got {c:?}"));
            }
        }
        Ok(())
    }
}

impl CreateJobRequest {
    fn into_new_job(self) -> Result<NewJob, AppError> {
        let min = parse_amount("budget_min", &self.budget_min).map_err(AppError::Validation)?;
        let max = parse_amount("budget_max", &self.budget_max).map_err(AppError::Validation)?;
        Ok(NewJob {
            title: self.title.trim().to_string(),
            description: self.description,
            category: self.category.trim().to_string(),
            budget: BudgetBounds::new(min, max)?,
            currency: self.currency.unwrap_or_else(|| "USD".into()),
            bidding_closes_at: self.bidding_closes_at,
        })
    }
}

/// Request to bid on an open job.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct PlaceBidRequest {
    /// Offered total, as a decimal string.
    pub amount: String,
    pub delivery_days: u32,
    #[serde(default)]
    pub cover_note: String,
}

impl Validate for PlaceBidRequest {
    fn validate(&self) -> Result<(), String> {
        parse_amount("amount", &self.amount)?;
        if self.delivery_days == 0 {
            return Err("delivery_days must be at least 1".into());
        }
        Ok(())
    }
}

/// Request to add a milestone to a job.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct AddMilestoneRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Decimal string.
    pub amount: String,
    /// A milestone still pending at this instant is cancelled by the sweep.
    pub fund_by: Option<DateTime<Utc>>,
}

impl Validate for AddMilestoneRequest {
    fn validate(&self) -> Result<(), String> {
        require_text("title", &self.title)?;
        parse_amount("amount", &self.amount)?;
        Ok(())
    }
}

/// Request to accept a bid, assigning the job.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct AcceptBidRequest {
    pub bid_id: Uuid,
    pub expected_version: Option<u64>,
}

/// Request to cancel a job.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CancelJobRequest {
    pub reason: String,
    pub expected_version: Option<u64>,
}

impl Validate for CancelJobRequest {
    fn validate(&self) -> Result<(), String> {
        require_text("reason", &self.reason)
    }
}

/// Request to review the counterparty of a completed job.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ReviewRequest {
    /// 1 to 5.
    pub rating: u8,
    #[serde(default)]
    pub comment: String,
}

impl Validate for ReviewRequest {
    fn validate(&self) -> Result<(), String> {
        if !(1..=5).contains(&self.rating) {
            return Err(format!("rating must be between 1 and 5, got {}", self.rating));
        }
        if self.comment.len() > 2000 {
            return Err("comment must be at most 2000 characters".into());
        }
        Ok(())
    }
}

// ── Router ──────────────────────────────────────────────────────────────

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/jobs", get(list_jobs).post(create_job))
        .route("/v1/jobs/:id", get(get_job))
        .route("/v1/jobs/:id/accept", post(accept_bid))
        .route("/v1/jobs/:id/start", post(start_job))
        .route("/v1/jobs/:id/complete", post(complete_job))
        .route("/v1/jobs/:id/cancel", post(cancel_job))
        .route("/v1/jobs/:id/bids", get(list_bids).post(place_bid))
        .route("/v1/jobs/:id/milestones", get(list_milestones).post(add_milestone))
        .route("/v1/jobs/:id/invoices", get(list_invoices))
        .route("/v1/jobs/:id/reviews", post(submit_review))
}

// ── Handlers ────────────────────────────────────────────────────────────

/// POST /v1/jobs: Post a job owned by the caller.
#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 201, description = "Job posted", body = serde_json::Value),
        (status = 422, description = "Invalid request", body = crate::error::ErrorBody),
    ),
    tag = "jobs"
)]
async fn create_job(
    State(state): State<AppState>,
    caller: CallerIdentity,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Job>), AppError> {
    let req = extract_validated_json(body)?;
    let job = state.market.create_job(&caller, req.into_new_job()?).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /v1/jobs: List jobs, newest first.
#[utoipa::path(
    get,
    path = "/v1/jobs",
    params(
        ("status" = Option<String>, Query, description = "open, assigned, in_progress, completed or cancelled"),
        ("client" = Option<Uuid>, Query, description = "Posting client"),
        ("freelancer" = Option<Uuid>, Query, description = "Assigned freelancer"),
        ("category" = Option<String>, Query, description = "Category, case-insensitive"),
    ),
    responses(
        (status = 200, description = "Matching jobs", body = serde_json::Value),
    ),
    tag = "jobs"
)]
async fn list_jobs(
    State(state): State<AppState>,
    query: Result<Query<JobFilter>, QueryRejection>,
) -> Result<Json<Vec<Job>>, AppError> {
    let filter = extract_query(query)?;
    Ok(Json(state.market.list_jobs(&filter)))
}

/// GET /v1/jobs/:id
#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job found", body = serde_json::Value),
        (status = 404, description = "Not found", body = crate::error::ErrorBody),
    ),
    tag = "jobs"
)]
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(state.market.job(id.into())?))
}

/// POST /v1/jobs/:id/accept: Client accepts a bid.
#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/accept",
    params(("id" = Uuid, Path, description = "Job ID")),
    request_body = AcceptBidRequest,
    responses(
        (status = 200, description = "Job assigned", body = serde_json::Value),
        (status = 403, description = "Caller is not the client", body = crate::error::ErrorBody),
        (status = 409, description = "Invalid transition or stale version", body = crate::error::ErrorBody),
    ),
    tag = "jobs"
)]
async fn accept_bid(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<AcceptBidRequest>, JsonRejection>,
) -> Result<Json<Job>, AppError> {
    let req = extract_json(body)?;
    let job = state
        .market
        .accept_bid(&caller, id.into(), req.bid_id.into(), req.expected_version)
        .await?;
    Ok(Json(job))
}

/// POST /v1/jobs/:id/start
#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/start",
    params(("id" = Uuid, Path, description = "Job ID")),
    request_body = VersionGuard,
    responses(
        (status = 200, description = "Job started", body = serde_json::Value),
        (status = 409, description = "Invalid transition or stale version", body = crate::error::ErrorBody),
    ),
    tag = "jobs"
)]
async fn start_job(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    guard: Option<Json<VersionGuard>>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(state.market.start_job(&caller, id.into(), expected(guard)).await?))
}

/// POST /v1/jobs/:id/complete
#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/complete",
    params(("id" = Uuid, Path, description = "Job ID")),
    request_body = VersionGuard,
    responses(
        (status = 200, description = "Job completed", body = serde_json::Value),
        (status = 409, description = "Milestones outstanding or stale version", body = crate::error::ErrorBody),
    ),
    tag = "jobs"
)]
async fn complete_job(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    guard: Option<Json<VersionGuard>>,
) -> Result<Json<Job>, AppError> {
    Ok(Json(state.market.complete_job(&caller, id.into(), expected(guard)).await?))
}

/// POST /v1/jobs/:id/cancel: Cancel and refund every held milestone.
#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/cancel",
    params(("id" = Uuid, Path, description = "Job ID")),
    request_body = CancelJobRequest,
    responses(
        (status = 200, description = "Job cancelled", body = serde_json::Value),
        (status = 409, description = "Invalid transition or stale version", body = crate::error::ErrorBody),
    ),
    tag = "jobs"
)]
async fn cancel_job(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<CancelJobRequest>, JsonRejection>,
) -> Result<Json<Job>, AppError> {
    let req = extract_validated_json(body)?;
    let job = state
        .market
        .cancel_job(&caller, id.into(), req.reason, req.expected_version)
        .await?;
    Ok(Json(job))
}

/// GET /v1/jobs/:id/bids
#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/bids",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Bids, oldest first", body = serde_json::Value),
        (status = 404, description = "Job not found", body = crate::error::ErrorBody),
    ),
    tag = "bids"
)]
async fn list_bids(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Bid>>, AppError> {
    Ok(Json(state.market.bids_for(id.into())?))
}

/// POST /v1/jobs/:id/bids: Freelancer bids on an open job.
#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/bids",
    params(("id" = Uuid, Path, description = "Job ID")),
    request_body = PlaceBidRequest,
    responses(
        (status = 201, description = "Bid placed", body = serde_json::Value),
        (status = 409, description = "Job not open or caller already bid", body = crate::error::ErrorBody),
        (status = 422, description = "Amount outside the budget", body = crate::error::ErrorBody),
    ),
    tag = "bids"
)]
async fn place_bid(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<PlaceBidRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Bid>), AppError> {
    let req = extract_validated_json(body)?;
    let input = NewBid {
        amount: parse_amount("amount", &req.amount).map_err(AppError::Validation)?,
        delivery_days: req.delivery_days,
        cover_note: req.cover_note,
    };
    let bid = state.market.place_bid(&caller, id.into(), input).await?;
    Ok((StatusCode::CREATED, Json(bid)))
}

/// GET /v1/jobs/:id/milestones
#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/milestones",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Milestones in creation order", body = serde_json::Value),
        (status = 404, description = "Job not found", body = crate::error::ErrorBody),
    ),
    tag = "milestones"
)]
async fn list_milestones(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Milestone>>, AppError> {
    Ok(Json(state.market.milestones_for(id.into())?))
}

/// POST /v1/jobs/:id/milestones: Client adds a milestone.
#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/milestones",
    params(("id" = Uuid, Path, description = "Job ID")),
    request_body = AddMilestoneRequest,
    responses(
        (status = 201, description = "Milestone added", body = serde_json::Value),
        (status = 403, description = "Caller is not the client", body = crate::error::ErrorBody),
        (status = 422, description = "Total exceeds the agreed amount", body = crate::error::ErrorBody),
    ),
    tag = "milestones"
)]
async fn add_milestone(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<AddMilestoneRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Milestone>), AppError> {
    let req = extract_validated_json(body)?;
    let input = NewMilestone {
        title: req.title.trim().to_string(),
        description: req.description,
        amount: parse_amount("amount", &req.amount).map_err(AppError::Validation)?,
        fund_by: req.fund_by,
    };
    let milestone = state.market.add_milestone(&caller, id.into(), input).await?;
    Ok((StatusCode::CREATED, Json(milestone)))
}

/// GET /v1/jobs/:id/invoices
#[utoipa::path(
    get,
    path = "/v1/jobs/{id}/invoices",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Invoices for completed milestones", body = serde_json::Value),
        (status = 404, description = "Job not found", body = crate::error::ErrorBody),
    ),
    tag = "jobs"
)]
async fn list_invoices(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Invoice>>, AppError> {
    Ok(Json(state.market.invoices_for(id.into())?))
}

/// POST /v1/jobs/:id/reviews: Rate the counterparty of a completed job.
#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/reviews",
    params(("id" = Uuid, Path, description = "Job ID")),
    request_body = ReviewRequest,
    responses(
        (status = 201, description = "Review recorded", body = serde_json::Value),
        (status = 409, description = "Job not completed or already reviewed", body = crate::error::ErrorBody),
    ),
    tag = "reputation"
)]
async fn submit_review(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<Uuid>,
    body: Result<Json<ReviewRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Review>), AppError> {
    let req = extract_validated_json(body)?;
    let review = state
        .market
        .submit_review(&caller, id.into(), req.rating, req.comment)
        .await?;
    Ok((StatusCode::CREATED, Json(review)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_request() -> CreateJobRequest {
        CreateJobRequest {
            title: "Logo".into(),
            description: String::new(),
            category: "design".into(),
            budget_min: "100".into(),
            budget_max: "500.50".into(),
            currency: None,
            bidding_closes_at: None,
        }
    }

    #[test]
    fn create_job_request_rules() {
        assert!(job_request().validate().is_ok());

        let mut req = job_request();
        req.currency = Some("usd".into());
        assert!(req.validate().unwrap_err().contains("ISO 4217"));

        let mut req = job_request();
        req.budget_max = "1.234".into();
        assert!(req.validate().unwrap_err().starts_with("budget_max"));

        let new_job = job_request().into_new_job().unwrap();
        assert_eq!(new_job.currency, "USD");
        assert_eq!(new_job.budget.max.minor(), 50_050);
    }

    #[test]
    fn inverted_budget_is_rejected_by_the_domain() {
        let mut req = job_request();
        req.budget_min = "900".into();
        assert!(req.validate().is_ok());
        assert!(matches!(req.into_new_job(), Err(AppError::Rejected(_))));
    }

    #[test]
    fn review_rating_bounds() {
        let review = |rating| ReviewRequest {
            rating,
            comment: String::new(),
        };
        assert!(review(0).validate().is_err());
        assert!(review(5).validate().is_ok());
        assert!(review(6).validate().is_err());
    }
}
