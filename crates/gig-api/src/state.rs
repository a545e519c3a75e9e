//! # Application State
//!
//! Shared state for the Axum application, passed to every handler through
//! the `State` extractor.
//!
//! ## Entity Store
//!
//! [`Store`] is the in-memory home of every versioned document. All reads
//! clone; all writes go through [`Store::commit`], a compare-and-swap on the
//! document's `version`. The lock is `parking_lot` and is never held across
//! an `.await`.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use gig_arbitration::Dispute;
use gig_core::{EntityKind, Rejection};
use gig_state::{Bid, DeliveryPackage, Job, Milestone};
use parking_lot::RwLock;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::auth::SecretToken;
use crate::middleware::metrics::ApiMetrics;
use crate::orchestration::Marketplace;
use crate::records::{Invoice, Review};

// -- Versioned documents -------------------------------------------------------

/// A document the store can compare-and-swap.
pub trait Versioned: Clone + Send + Sync + 'static {
    /// Entity kind used in conflict and not-found rejections.
    const KIND: EntityKind;

    /// Primary key.
    fn key(&self) -> Uuid;

    /// Current optimistic-concurrency version.
    fn version(&self) -> u64;
}

macro_rules! versioned {
    ($ty:ty, $kind:expr) => {
        impl Versioned for $ty {
            const KIND: EntityKind = $kind;

            fn key(&self) -> Uuid {
                self.id.into()
            }

            fn version(&self) -> u64 {
                self.version
            }
        }
    };
}

versioned!(Job, EntityKind::Job);
versioned!(Bid, EntityKind::Bid);
versioned!(Milestone, EntityKind::Milestone);
versioned!(DeliveryPackage, EntityKind::Delivery);
versioned!(Dispute, EntityKind::Dispute);
versioned!(Review, EntityKind::Review);
versioned!(Invoice, EntityKind::Invoice);

// -- Generic In-Memory Store ---------------------------------------------------

/// Thread-safe, cloneable in-memory document store with CAS writes.
#[derive(Debug)]
pub struct Store<T: Versioned> {
    data: Arc<RwLock<HashMap<Uuid, T>>>,
}

impl<T: Versioned> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: Versioned> Store<T> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert a new document. Fails if the key is taken.
    pub fn insert_new(&self, value: T) -> Result<(), Rejection> {
        let mut guard = self.data.write();
        let id = value.key();
        if let Some(existing) = guard.get(&id) {
            return Err(Rejection::conflict(T::KIND, id, 0, existing.version()));
        }
        guard.insert(id, value);
        Ok(())
    }

    /// Replace a document whose stored version equals `expected`.
    pub fn commit(&self, expected: u64, value: T) -> Result<(), Rejection> {
        let mut guard = self.data.write();
        let id = value.key();
        let current = guard
            .get(&id)
            .ok_or_else(|| Rejection::not_found(T::KIND, id))?;
        if current.version() != expected {
            return Err(Rejection::conflict(T::KIND, id, expected, current.version()));
        }
        guard.insert(id, value);
        Ok(())
    }

    /// Verify a pending write would succeed: `None` expects the key to be
    /// free, `Some(v)` expects the stored version to be `v`.
    pub fn check(&self, id: Uuid, expected: Option<u64>) -> Result<(), Rejection> {
        let guard = self.data.read();
        match (guard.get(&id), expected) {
            (None, None) => Ok(()),
            (Some(existing), None) => Err(Rejection::conflict(T::KIND, id, 0, existing.version())),
            (None, Some(_)) => Err(Rejection::not_found(T::KIND, id)),
            (Some(current), Some(v)) if current.version() != v => {
                Err(Rejection::conflict(T::KIND, id, v, current.version()))
            }
            (Some(_), Some(_)) => Ok(()),
        }
    }

    /// Load a document without version checks. Used for hydration only.
    pub fn restore(&self, value: T) {
        self.data.write().insert(value.key(), value);
    }

    /// Retrieve a document by id.
    pub fn get(&self, id: impl Into<Uuid>) -> Option<T> {
        self.data.read().get(&id.into()).cloned()
    }

    /// Retrieve a document or answer `NotFound`.
    pub fn require(&self, id: impl Into<Uuid>) -> Result<T, Rejection> {
        let id = id.into();
        self.get(id).ok_or_else(|| Rejection::not_found(T::KIND, id))
    }

    /// Every document matching `pred`.
    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.data.read().values().filter(|v| pred(v)).cloned().collect()
    }

    /// List all documents.
    pub fn list(&self) -> Vec<T> {
        self.data.read().values().cloned().collect()
    }

    /// Return the number of documents.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Versioned> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fail when a caller-supplied version does not match the stored one.
pub fn expect_version<T: Versioned>(current: &T, expected: Option<u64>) -> Result<(), Rejection> {
    match expected {
        Some(v) if v != current.version() => Err(Rejection::conflict(
            T::KIND,
            current.key(),
            v,
            current.version(),
        )),
        _ => Ok(()),
    }
}

// -- Configuration -------------------------------------------------------------

/// Invalid environment configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set but could not be parsed.
    #[error("{name}={value:?} is not a valid value")]
    Invalid { name: &'static str, value: String },
}

/// Application configuration.
///
/// Custom `Debug` redacts secrets to prevent credential leakage in logs.
#[derive(Clone)]
pub struct AppConfig {
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Shared bearer secret. If `None`, authentication is disabled.
    pub auth_token: Option<SecretToken>,
    /// Settlement collaborator. If `None`, the in-memory mock gateway is used.
    pub settlement_gateway_url: Option<String>,
    pub settlement_api_key: Option<SecretToken>,
    pub settlement_max_attempts: u32,
    pub settlement_base_delay_ms: u64,
    pub platform_fee_bps: u32,
    /// Hours a client has to fund the first milestone after assignment.
    pub fund_window_hours: i64,
    pub max_rejections: Option<u32>,
    pub workspace_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub reputation_inactivity_days: i64,
    pub reputation_half_life_days: u32,
    pub dispute_sla_hours: i64,
    /// Largest accepted request body.
    pub body_limit_bytes: usize,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("port", &self.port)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("settlement_gateway_url", &self.settlement_gateway_url)
            .field(
                "settlement_api_key",
                &self.settlement_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("settlement_max_attempts", &self.settlement_max_attempts)
            .field("settlement_base_delay_ms", &self.settlement_base_delay_ms)
            .field("platform_fee_bps", &self.platform_fee_bps)
            .field("fund_window_hours", &self.fund_window_hours)
            .field("max_rejections", &self.max_rejections)
            .field("workspace_timeout_secs", &self.workspace_timeout_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("reputation_inactivity_days", &self.reputation_inactivity_days)
            .field("reputation_half_life_days", &self.reputation_half_life_days)
            .field("dispute_sla_hours", &self.dispute_sla_hours)
            .field("body_limit_bytes", &self.body_limit_bytes)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_token: None,
            settlement_gateway_url: None,
            settlement_api_key: None,
            settlement_max_attempts: 3,
            settlement_base_delay_ms: 200,
            platform_fee_bps: 0,
            fund_window_hours: 72,
            max_rejections: None,
            workspace_timeout_secs: 300,
            sweep_interval_secs: 60,
            reputation_inactivity_days: 90,
            reputation_half_life_days: 180,
            dispute_sla_hours: 72,
            body_limit_bytes: 1024 * 1024,
        }
    }
}

impl AppConfig {
    /// Build configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Ok(Self {
            port: parse(&lookup, "PORT", d.port)?,
            auth_token: non_empty("AUTH_TOKEN").map(SecretToken::new),
            settlement_gateway_url: non_empty("SETTLEMENT_GATEWAY_URL"),
            settlement_api_key: non_empty("SETTLEMENT_API_KEY").map(SecretToken::new),
            settlement_max_attempts: parse(&lookup, "SETTLEMENT_MAX_ATTEMPTS", d.settlement_max_attempts)?,
            settlement_base_delay_ms: parse(&lookup, "SETTLEMENT_BASE_DELAY_MS", d.settlement_base_delay_ms)?,
            platform_fee_bps: parse(&lookup, "PLATFORM_FEE_BPS", d.platform_fee_bps)?,
            fund_window_hours: parse(&lookup, "FUND_WINDOW_HOURS", d.fund_window_hours)?,
            max_rejections: match non_empty("MAX_REJECTIONS") {
                Some(v) => Some(v.trim().parse().map_err(|_| ConfigError::Invalid {
                    name: "MAX_REJECTIONS",
                    value: v.clone(),
                })?),
                None => None,
            },
            workspace_timeout_secs: parse(&lookup, "WORKSPACE_TIMEOUT_SECS", d.workspace_timeout_secs)?,
            sweep_interval_secs: parse(&lookup, "SWEEP_INTERVAL_SECS", d.sweep_interval_secs)?,
            reputation_inactivity_days: parse(&lookup, "REPUTATION_INACTIVITY_DAYS", d.reputation_inactivity_days)?,
            reputation_half_life_days: parse(&lookup, "REPUTATION_HALF_LIFE_DAYS", d.reputation_half_life_days)?,
            dispute_sla_hours: parse(&lookup, "DISPUTE_SLA_HOURS", d.dispute_sla_hours)?,
            body_limit_bytes: parse(&lookup, "BODY_LIMIT_BYTES", d.body_limit_bytes)?,
        })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        _ => Ok(default),
    }
}

// -- Application State ---------------------------------------------------------

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// Orchestration over every entity store and collaborator.
    pub market: Arc<Marketplace>,
    pub metrics: ApiMetrics,
    /// When `Some`, documents are written through to Postgres.
    pub db_pool: Option<PgPool>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("persistent", &self.db_pool.is_some())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Assemble state around an already-built marketplace.
    pub fn new(config: AppConfig, market: Arc<Marketplace>, metrics: ApiMetrics, db_pool: Option<PgPool>) -> Self {
        Self {
            config,
            market,
            metrics,
            db_pool,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gig_core::{Amount, UserId};
    use gig_state::{BudgetBounds, NewJob};

    fn job() -> Job {
        Job::create(
            UserId::new(),
            NewJob {
                title: "Logo".into(),
                description: "Vector logo".into(),
                category: "design".into(),
                budget: BudgetBounds::new(Amount::from_major(100).unwrap(), Amount::from_major(200).unwrap()).unwrap(),
                currency: "USD".into(),
                bidding_closes_at: None,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn commit_rejects_stale_version() {
        let store = Store::<Job>::new();
        let j = job();
        store.insert_new(j.clone()).unwrap();

        let mut next = j.clone();
        next.version += 1;
        store.commit(j.version, next.clone()).unwrap();

        let err = store.commit(j.version, next).unwrap_err();
        assert!(matches!(err, Rejection::Conflict { expected: 1, actual: 2, .. }));
    }

    #[test]
    fn insert_new_refuses_duplicates() {
        let store = Store::<Job>::new();
        let j = job();
        store.insert_new(j.clone()).unwrap();
        assert!(store.insert_new(j).is_err());
    }

    #[test]
    fn expect_version_passes_without_expectation() {
        let j = job();
        assert!(expect_version(&j, None).is_ok());
        assert!(expect_version(&j, Some(j.version)).is_ok());
        assert!(expect_version(&j, Some(j.version + 1)).is_err());
    }

    #[test]
    fn config_from_lookup_applies_defaults_and_overrides() {
        let cfg = AppConfig::from_lookup(|name| match name {
            "PORT" => Some("9090".into()),
            "PLATFORM_FEE_BPS" => Some("250".into()),
            "MAX_REJECTIONS" => Some("3".into()),
            "AUTH_TOKEN" => Some("s3cret".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.platform_fee_bps, 250);
        assert_eq!(cfg.max_rejections, Some(3));
        assert_eq!(cfg.fund_window_hours, 72);
        assert!(!format!("{cfg:?}").contains("s3cret"));
    }

    #[test]
    fn config_rejects_garbage() {
        let err = AppConfig::from_lookup(|name| (name == "PORT").then(|| "eighty".into())).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PORT", .. }));
    }
}
