//! Settlement journal persistence on the `settlement_intents` table.

use gig_escrow::JournalEntry;
use sqlx::PgPool;
use uuid::Uuid;

use super::{from_json, to_json};

/// Upsert journal entries. Legs only move forward, so the latest write wins.
pub async fn save_all(pool: &PgPool, entries: &[JournalEntry]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for entry in entries {
        let body = to_json("settlement intent", entry)?;
        sqlx::query(
            "INSERT INTO settlement_intents (intent_id, batch_id, milestone_id, status, body, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (intent_id) DO UPDATE
             SET status = EXCLUDED.status, body = EXCLUDED.body, updated_at = EXCLUDED.updated_at
             WHERE settlement_intents.updated_at <= EXCLUDED.updated_at",
        )
        .bind(Uuid::from(entry.intent.intent_id))
        .bind(Uuid::from(entry.intent.batch_id))
        .bind(Uuid::from(entry.intent.milestone_id))
        .bind(entry.status.as_str())
        .bind(&body)
        .bind(entry.updated_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

pub async fn load_all(pool: &PgPool) -> Result<Vec<JournalEntry>, sqlx::Error> {
    let bodies: Vec<(serde_json::Value,)> =
        sqlx::query_as("SELECT body FROM settlement_intents ORDER BY updated_at")
            .fetch_all(pool)
            .await?;
    bodies
        .into_iter()
        .map(|(body,)| from_json("settlement intent", body))
        .collect()
}
