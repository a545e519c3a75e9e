//! # Database Persistence Layer
//!
//! Optional Postgres write-through via SQLx. When `DATABASE_URL` is set,
//! every committed document, settlement journal entry and reputation record
//! is upserted after the in-memory commit, and the whole state is loaded
//! back on startup. Without it the service runs in-memory only.
//!
//! Documents are stored as JSON bodies keyed by id with their version
//! alongside. Upserts never replace a newer version with an older one, so
//! write-through from concurrent operations can arrive in any order.

pub mod documents;
pub mod intents;
pub mod reputation;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Initialize the connection pool and run migrations.
///
/// Returns `None` if `DATABASE_URL` is not set (in-memory-only mode).
/// Returns `Err` if the URL is set but the connection or migration fails.
pub async fn init_pool() -> Result<Option<PgPool>, sqlx::Error> {
    let url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; running in-memory only, state will not survive restarts");
            return Ok(None);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&url)
        .await?;

    tracing::info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    Ok(Some(pool))
}

pub(crate) fn encode_version(version: u64) -> Result<i64, sqlx::Error> {
    i64::try_from(version).map_err(|_| sqlx::Error::Protocol(format!("version {version} out of range")))
}

pub(crate) fn to_json<T: serde::Serialize>(what: &str, value: &T) -> Result<serde_json::Value, sqlx::Error> {
    serde_json::to_value(value).map_err(|e| sqlx::Error::Protocol(format!("failed to serialize {what}: {e}")))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(what: &str, value: serde_json::Value) -> Result<T, sqlx::Error> {
    serde_json::from_value(value).map_err(|e| sqlx::Error::Protocol(format!("failed to deserialize {what}: {e}")))
}
