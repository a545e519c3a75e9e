//! # OpenAPI Specification Assembly
//!
//! Assembles every utoipa-documented route into a single OpenAPI document
//! served at `/openapi.json`.

use axum::routing::get;
use axum::{Json, Router};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::state::AppState;

/// Adds the bearer token security scheme.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .description(Some(
                            "Token of the form `{kind}:{user_id}:{secret}` where kind is member, arbiter or system. \
                             The secret is set via the AUTH_TOKEN env var.",
                        ))
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Gig Escrow API",
        description = "Job, milestone and escrow lifecycle for a freelance marketplace.\n\nProvides:\n- **Jobs and bids**: posting, bidding, assignment, cancellation\n- **Milestones**: fund, start, submit, approve, reject, with escrow settlement\n- **Disputes**: raise, claim, resolve by release, refund or split\n- **Settlement**: rail acknowledgments, operator retry, journal inspection\n- **Workspace presence** and **reputation**\n\nAll `/v1/*` endpoints require authentication. Health probes and `/metrics` do not.",
        license(name = "BUSL-1.1")
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development server"),
    ),
    security(
        ("bearer_auth" = [])
    ),
    paths(
        // ── Jobs ────────────────────────────────────────────────────────
        crate::routes::jobs::create_job,
        crate::routes::jobs::list_jobs,
        crate::routes::jobs::get_job,
        crate::routes::jobs::accept_bid,
        crate::routes::jobs::start_job,
        crate::routes::jobs::complete_job,
        crate::routes::jobs::cancel_job,
        crate::routes::jobs::list_invoices,
        // ── Bids ────────────────────────────────────────────────────────
        crate::routes::jobs::list_bids,
        crate::routes::jobs::place_bid,
        crate::routes::bids::get_bid,
        crate::routes::bids::shortlist_bid,
        crate::routes::bids::decline_bid,
        crate::routes::bids::withdraw_bid,
        // ── Milestones ──────────────────────────────────────────────────
        crate::routes::jobs::list_milestones,
        crate::routes::jobs::add_milestone,
        crate::routes::milestones::get_milestone,
        crate::routes::milestones::fund_milestone,
        crate::routes::milestones::start_milestone,
        crate::routes::milestones::submit_milestone,
        crate::routes::milestones::approve_milestone,
        crate::routes::milestones::reject_milestone,
        crate::routes::milestones::list_deliveries,
        // ── Disputes ────────────────────────────────────────────────────
        crate::routes::milestones::raise_dispute,
        crate::routes::disputes::list_disputes,
        crate::routes::disputes::overdue_disputes,
        crate::routes::disputes::get_dispute,
        crate::routes::disputes::claim_dispute,
        crate::routes::disputes::resolve_dispute,
        crate::routes::disputes::dismiss_dispute,
        // ── Settlement ──────────────────────────────────────────────────
        crate::routes::settlement::acknowledge,
        crate::routes::settlement::list_stalled,
        crate::routes::settlement::retry_intent,
        crate::routes::settlement::get_batch,
        // ── Workspace ───────────────────────────────────────────────────
        crate::routes::workspace::join,
        crate::routes::workspace::list_participants,
        crate::routes::workspace::heartbeat,
        crate::routes::workspace::leave,
        // ── Reputation ──────────────────────────────────────────────────
        crate::routes::jobs::submit_review,
        crate::routes::reputation::get_reputation,
        crate::routes::reputation::sync_reputation,
        crate::routes::reputation::verify_reputation,
        crate::routes::reputation::list_reviews,
        crate::routes::reputation::apply_decay,
        // ── Admin ───────────────────────────────────────────────────────
        crate::routes::admin::sweep,
    ),
    components(
        schemas(
            crate::error::ErrorBody,
            crate::error::ErrorDetail,
            crate::routes::VersionGuard,
            crate::routes::jobs::CreateJobRequest,
            crate::routes::jobs::PlaceBidRequest,
            crate::routes::jobs::AddMilestoneRequest,
            crate::routes::jobs::AcceptBidRequest,
            crate::routes::jobs::CancelJobRequest,
            crate::routes::jobs::ReviewRequest,
            crate::routes::milestones::FileInput,
            crate::routes::milestones::SubmitRequest,
            crate::routes::milestones::ApproveRequest,
            crate::routes::milestones::RejectRequest,
            crate::routes::milestones::RaiseDisputeRequest,
            crate::routes::disputes::ResolveRequest,
            crate::routes::disputes::DismissRequest,
            crate::routes::settlement::AckRequest,
            crate::routes::workspace::HeartbeatRequest,
            crate::routes::reputation::DecayRequest,
            crate::routes::admin::SweepRequest,
        ),
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "jobs", description = "Job postings, assignment, cancellation and invoices"),
        (name = "bids", description = "Bidding on open jobs"),
        (name = "milestones", description = "Milestone escrow lifecycle and delivery packages"),
        (name = "disputes", description = "Dispute raising and arbiter rulings"),
        (name = "settlement", description = "Settlement acknowledgments, stalled legs and batch inspection"),
        (name = "workspace", description = "Job workspace presence"),
        (name = "reputation", description = "Reviews and per-role reputation"),
        (name = "admin", description = "Deadline sweep"),
    )
)]
pub struct ApiDoc;

/// Serves the OpenAPI JSON at `/openapi.json`.
pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_json))
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_generates_with_crate_version() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "Gig Escrow API");
        assert_eq!(spec.info.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn spec_lists_lifecycle_paths() {
        let spec = ApiDoc::openapi();
        for path in [
            "/v1/jobs",
            "/v1/jobs/{id}/accept",
            "/v1/milestones/{id}/approve",
            "/v1/milestones/{id}/disputes",
            "/v1/disputes/{id}/resolve",
            "/v1/settlement/acks",
            "/v1/admin/sweep",
        ] {
            assert!(spec.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn spec_has_bearer_scheme() {
        let spec = ApiDoc::openapi();
        let components = spec.components.expect("components");
        assert!(components.security_schemes.contains_key("bearer_auth"));
    }
}
