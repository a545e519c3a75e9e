//! # gig-api: Binary Entry Point
//!
//! Starts the Axum HTTP server for the escrow engine, the workspace
//! presence reaper and the periodic deadline sweep.

use std::time::Duration;

use gig_api::state::AppConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured tracing. LOG_FORMAT=json switches to JSON lines.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = AppConfig::from_env().map_err(|e| {
        tracing::error!("Invalid configuration: {e}");
        e
    })?;
    let port = config.port;
    let sweep_every = Duration::from_secs(config.sweep_interval_secs.max(1));
    let reap_every = Duration::from_secs((config.workspace_timeout_secs / 2).max(1));

    // Database pool is optional; absent means in-memory only.
    let db_pool = gig_api::db::init_pool().await.map_err(|e| {
        tracing::error!("Database initialization failed: {e}");
        e
    })?;

    let state = gig_api::bootstrap::bootstrap(config, db_pool).map_err(|e| {
        tracing::error!("Bootstrap failed: {e}");
        e
    })?;

    state.market.hydrate().await.map_err(|e| {
        tracing::error!("Database hydration failed: {e}");
        e
    })?;

    gig_presence::spawn_reaper(state.market.workspaces().clone(), reap_every);

    let market = state.market.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = market.sweep_expired(chrono::Utc::now()).await;
            if report.cancelled_count > 0 {
                tracing::info!(?report, "deadline sweep cancelled expired work");
            }
        }
    });

    let app = gig_api::app(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Gig escrow API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
