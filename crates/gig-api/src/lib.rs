//! # gig-api: Axum API for the Escrow Engine
//!
//! HTTP surface over the job, milestone and escrow lifecycle. Domain rules
//! live in the `gig-*` crates; this crate owns the entity stores, the
//! orchestration that keeps them consistent, authentication, metrics and
//! optional Postgres persistence.
//!
//! ## API Surface
//!
//! | Prefix                         | Module                     |
//! |--------------------------------|----------------------------|
//! | `/v1/jobs/*`                   | [`routes::jobs`]           |
//! | `/v1/bids/*`                   | [`routes::bids`]           |
//! | `/v1/milestones/*`             | [`routes::milestones`]     |
//! | `/v1/disputes/*`               | [`routes::disputes`]       |
//! | `/v1/settlement/*`             | [`routes::settlement`]     |
//! | `/v1/jobs/:id/workspace`, `/v1/workspace/*` | [`routes::workspace`] |
//! | `/v1/users/*`, `/v1/reputation/*` | [`routes::reputation`]  |
//! | `/v1/admin/*`                  | [`routes::admin`]          |
//!
//! ## Middleware Stack (execution order)
//!
//! ```text
//! TraceLayer → MetricsMiddleware → AuthMiddleware → BodyLimit → Handler
//! ```
//!
//! Health probes and `/metrics` sit outside authentication.

pub mod auth;
pub mod bootstrap;
pub mod db;
pub mod error;
pub mod extractors;
pub mod middleware;
pub mod openapi;
pub mod orchestration;
pub mod records;
pub mod routes;
pub mod state;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::response::IntoResponse;
use axum::{Extension, Router};
use tower_http::trace::TraceLayer;

use crate::auth::AuthConfig;
use crate::middleware::metrics::ApiMetrics;
use crate::state::AppState;

/// Assemble the full application router with all routes and middleware.
pub fn app(state: AppState) -> Router {
    let auth_config = AuthConfig {
        token: state.config.auth_token.clone(),
    };
    let metrics = state.metrics.clone();

    let api = Router::new()
        .merge(routes::jobs::router())
        .merge(routes::bids::router())
        .merge(routes::milestones::router())
        .merge(routes::disputes::router())
        .merge(routes::settlement::router())
        .merge(routes::workspace::router())
        .merge(routes::reputation::router())
        .merge(routes::admin::router())
        .merge(openapi::router())
        .layer(DefaultBodyLimit::max(state.config.body_limit_bytes))
        .layer(from_fn(auth::auth_middleware))
        .layer(from_fn(middleware::metrics::metrics_middleware))
        .layer(Extension(metrics.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(auth_config))
        .with_state(state.clone());

    let unauthenticated = Router::new()
        .route("/health/liveness", axum::routing::get(liveness))
        .route("/health/readiness", axum::routing::get(readiness))
        .route("/metrics", axum::routing::get(prometheus_metrics))
        .layer(Extension(metrics))
        .with_state(state);

    Router::new().merge(unauthenticated).merge(api)
}

/// GET /metrics: Prometheus scrape endpoint. Gauges are refreshed per scrape.
async fn prometheus_metrics(
    State(state): State<AppState>,
    Extension(metrics): Extension<ApiMetrics>,
) -> impl IntoResponse {
    state.market.refresh_gauges();

    match metrics.gather_and_encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode Prometheus metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e).into_response()
        }
    }
}

/// Liveness probe: 200 while the process runs.
async fn liveness() -> &'static str {
    "ok"
}

/// Readiness probe: 503 when the configured database is unreachable.
async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(pool) = &state.db_pool {
        if let Err(e) = sqlx::query("SELECT 1").execute(pool).await {
            tracing::warn!("Database health check failed: {e}");
            return (StatusCode::SERVICE_UNAVAILABLE, "database unreachable").into_response();
        }
    }

    (StatusCode::OK, "ready").into_response()
}
