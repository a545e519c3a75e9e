//! Reputation record persistence on the `reputation_records` table.

use gig_reputation::ReputationRecord;
use sqlx::PgPool;
use uuid::Uuid;

use super::{from_json, to_json};

pub async fn save_all(pool: &PgPool, records: &[ReputationRecord]) -> Result<(), sqlx::Error> {
    if records.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for record in records {
        let body = to_json("reputation record", record)?;
        sqlx::query(
            "INSERT INTO reputation_records (user_id, role, score, body, updated_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (user_id, role) DO UPDATE
             SET score = EXCLUDED.score, body = EXCLUDED.body, updated_at = EXCLUDED.updated_at",
        )
        .bind(Uuid::from(record.user_id))
        .bind(record.role.as_str())
        .bind(i64::from(record.score))
        .bind(&body)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

pub async fn load_all(pool: &PgPool) -> Result<Vec<ReputationRecord>, sqlx::Error> {
    let bodies: Vec<(serde_json::Value,)> =
        sqlx::query_as("SELECT body FROM reputation_records ORDER BY user_id, role")
            .fetch_all(pool)
            .await?;
    bodies
        .into_iter()
        .map(|(body,)| from_json("reputation record", body))
        .collect()
}
