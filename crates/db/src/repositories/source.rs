use chrono::{DateTime, Utc};
use sqlx::Row;

use apflow_core::domain::item::ApItemId;
use apflow_core::domain::source::{Source, SourceId, SourceType};

use super::{RepositoryError, SourceRepository};
use crate::DbPool;

pub struct SqlSourceRepository {
    pool: DbPool,
}

impl SqlSourceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_source(row: &sqlx::sqlite::SqliteRow) -> Result<Source, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let ap_item_id: String =
        row.try_get("ap_item_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let source_type: String =
        row.try_get("source_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let source_ref: String =
        row.try_get("source_ref").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let subject: Option<String> =
        row.try_get("subject").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let sender: Option<String> =
        row.try_get("sender").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let detected_at_str: String =
        row.try_get("detected_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let detected_at = DateTime::parse_from_rfc3339(&detected_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(Source {
        id: SourceId(id),
        ap_item_id: ApItemId(ap_item_id),
        source_type: SourceType::parse(&source_type),
        source_ref,
        subject,
        sender,
        detected_at,
    })
}

#[async_trait::async_trait]
impl SourceRepository for SqlSourceRepository {
    async fn link(&self, source: &Source) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO ap_source
                 (id, ap_item_id, source_type, source_ref, subject, sender, detected_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(ap_item_id, source_type, source_ref) DO NOTHING",
        )
        .bind(&source.id.0)
        .bind(&source.ap_item_id.0)
        .bind(source.source_type.as_str())
        .bind(&source.source_ref)
        .bind(&source.subject)
        .bind(&source.sender)
        .bind(source.detected_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_for_item(&self, id: &ApItemId) -> Result<Vec<Source>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT id, ap_item_id, source_type, source_ref, subject, sender, detected_at
             FROM ap_source WHERE ap_item_id = ? ORDER BY detected_at ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_source).collect()
    }

    async fn count_for_item(&self, id: &ApItemId) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM ap_source WHERE ap_item_id = ?")
            .bind(&id.0)
            .fetch_one(&self.pool)
            .await?;

        row.try_get("count").map_err(|e| RepositoryError::Decode(e.to_string()))
    }

    async fn record_attachment_hashes(
        &self,
        id: &ApItemId,
        hashes: &[String],
    ) -> Result<(), RepositoryError> {
        let recorded_at = Utc::now().to_rfc3339();

        for hash in hashes {
            sqlx::query(
                "INSERT INTO ap_item_attachment (ap_item_id, content_hash, recorded_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(ap_item_id, content_hash) DO NOTHING",
            )
            .bind(&id.0)
            .bind(hash)
            .bind(&recorded_at)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn attachment_hashes_for_item(
        &self,
        id: &ApItemId,
    ) -> Result<Vec<String>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT content_hash FROM ap_item_attachment
             WHERE ap_item_id = ? ORDER BY recorded_at ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("content_hash")
                    .map_err(|e| RepositoryError::Decode(e.to_string()))
            })
            .collect()
    }
}
