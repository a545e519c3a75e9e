//! Versioned document persistence on the `documents` table.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use super::{encode_version, from_json};
use crate::orchestration::Document;

/// Upsert committed documents in one transaction. A stored row is only
/// replaced by a strictly newer version.
pub async fn save_all(pool: &PgPool, docs: &[Document]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();
    for doc in docs {
        let body = doc
            .body()
            .map_err(|e| sqlx::Error::Protocol(format!("failed to serialize {} {}: {e}", doc.kind(), doc.id())))?;
        sqlx::query(
            "INSERT INTO documents (id, kind, job_id, version, body, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE
             SET version = EXCLUDED.version, body = EXCLUDED.body, updated_at = EXCLUDED.updated_at
             WHERE documents.version < EXCLUDED.version",
        )
        .bind(doc.id())
        .bind(doc.kind().as_str())
        .bind(Uuid::from(doc.job_id()))
        .bind(encode_version(doc.version())?)
        .bind(&body)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

/// Every stored document, decoded by kind.
pub async fn load_all(pool: &PgPool) -> Result<Vec<Document>, sqlx::Error> {
    let rows = sqlx::query_as::<_, DocumentRow>("SELECT kind, body FROM documents ORDER BY updated_at")
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(DocumentRow::into_document).collect()
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    kind: String,
    body: serde_json::Value,
}

impl DocumentRow {
    fn into_document(self) -> Result<Document, sqlx::Error> {
        Ok(match self.kind.as_str() {
            "job" => Document::Job(from_json("job", self.body)?),
            "bid" => Document::Bid(from_json("bid", self.body)?),
            "milestone" => Document::Milestone(from_json("milestone", self.body)?),
            "delivery" => Document::Delivery(from_json("delivery", self.body)?),
            "dispute" => Document::Dispute(from_json("dispute", self.body)?),
            "review" => Document::Review(from_json("review", self.body)?),
            "invoice" => Document::Invoice(from_json("invoice", self.body)?),
            other => return Err(sqlx::Error::Protocol(format!("unknown document kind '{other}'"))),
        })
    }
}
