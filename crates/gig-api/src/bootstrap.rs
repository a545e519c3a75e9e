//! # Service Bootstrap
//!
//! Turns an [`AppConfig`] into a ready [`AppState`]:
//!
//! 1. **Settlement gateway**: HTTP client when `SETTLEMENT_GATEWAY_URL` is
//!    set, otherwise the in-memory mock.
//! 2. **Lifecycle tuning**: retry policy, platform fee, presence timeout,
//!    reputation decay and milestone policy.
//! 3. **Metrics**: one registry shared by the marketplace and `/metrics`.
//! 4. **Persistence**: write-through to Postgres when a pool is supplied.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use gig_core::TracingPublisher;
use gig_escrow::{
    EscrowError, FeeSchedule, GatewayError, HttpGatewayConfig, HttpSettlementGateway, MockSettlementGateway,
    RetryPolicy, SettlementGateway,
};
use gig_presence::PresenceConfig;
use gig_reputation::ReputationConfig;
use sqlx::PgPool;

use crate::middleware::metrics::ApiMetrics;
use crate::orchestration::{MarketConfig, Marketplace};
use crate::state::{AppConfig, AppState};

/// Errors during service bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The settlement gateway client could not be built.
    #[error("settlement gateway: {0}")]
    Gateway(#[from] GatewayError),

    /// Fee configuration out of range.
    #[error("fee schedule: {0}")]
    Fees(#[from] EscrowError),

    /// Metric registration failed.
    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Pick the settlement gateway named by configuration.
pub fn settlement_gateway(config: &AppConfig) -> Result<Arc<dyn SettlementGateway>, BootstrapError> {
    match &config.settlement_gateway_url {
        Some(url) => {
            let mut gateway_config = HttpGatewayConfig::new(url.clone());
            if let Some(key) = &config.settlement_api_key {
                gateway_config = gateway_config.with_api_key(key.expose());
            }
            let gateway = HttpSettlementGateway::new(gateway_config)?;
            tracing::info!(url = %url, "settlement gateway configured");
            Ok(Arc::new(gateway))
        }
        None => {
            tracing::warn!("SETTLEMENT_GATEWAY_URL not set; using the in-memory mock gateway");
            Ok(Arc::new(MockSettlementGateway::new()))
        }
    }
}

/// Build the marketplace and application state from configuration.
pub fn bootstrap(config: AppConfig, db_pool: Option<PgPool>) -> Result<AppState, BootstrapError> {
    let gateway = settlement_gateway(&config)?;
    bootstrap_with_gateway(config, gateway, db_pool)
}

/// Same as [`bootstrap`] around a caller-supplied gateway.
pub fn bootstrap_with_gateway(
    config: AppConfig,
    gateway: Arc<dyn SettlementGateway>,
    db_pool: Option<PgPool>,
) -> Result<AppState, BootstrapError> {
    let metrics = ApiMetrics::new()?;
    let fees = FeeSchedule::new(config.platform_fee_bps)?;

    let mut builder = Marketplace::builder(gateway)
        .publisher(Arc::new(TracingPublisher))
        .retry(RetryPolicy::new(
            config.settlement_max_attempts,
            StdDuration::from_millis(config.settlement_base_delay_ms),
        ))
        .fees(fees)
        .presence(PresenceConfig {
            timeout: Duration::seconds(i64::try_from(config.workspace_timeout_secs).unwrap_or(i64::MAX)),
            ..PresenceConfig::default()
        })
        .reputation(ReputationConfig {
            inactivity_days: config.reputation_inactivity_days,
            half_life_days: config.reputation_half_life_days,
            ..ReputationConfig::default()
        })
        .config(MarketConfig::from_app(&config))
        .metrics(metrics.clone());
    if let Some(pool) = &db_pool {
        builder = builder.database(pool.clone());
    }
    let market = builder.build()?;

    tracing::info!(
        port = config.port,
        platform_fee_bps = config.platform_fee_bps,
        persistent = db_pool.is_some(),
        auth = config.auth_token.is_some(),
        "marketplace bootstrapped"
    );
    Ok(AppState::new(config, Arc::new(market), metrics, db_pool))
}
