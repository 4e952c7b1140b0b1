use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use apflow_core::domain::item::{ApItem, ApItemId, ApState, ItemMetadata, OrganizationId};
use apflow_core::domain::source::SourceId;

use super::{ItemRepository, RepositoryError};
use crate::DbPool;

pub struct SqlItemRepository {
    pool: DbPool,
}

impl SqlItemRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const ITEM_COLUMNS: &str = "id, organization_id, invoice_key, vendor_name, amount, currency,
     invoice_number, due_date, confidence, state, approval_required,
     post_attempted_at, erp_reference, metadata_json, created_at, updated_at";

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<ApItem, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let organization_id: String =
        row.try_get("organization_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let invoice_key: String =
        row.try_get("invoice_key").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let vendor_name: String =
        row.try_get("vendor_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let amount_str: String =
        row.try_get("amount").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let currency: String =
        row.try_get("currency").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let invoice_number: Option<String> =
        row.try_get("invoice_number").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let due_date_str: Option<String> =
        row.try_get("due_date").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let confidence: f64 =
        row.try_get("confidence").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let state_str: String =
        row.try_get("state").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let approval_required: bool =
        row.try_get("approval_required").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let post_attempted_at_str: Option<String> =
        row.try_get("post_attempted_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let erp_reference: Option<String> =
        row.try_get("erp_reference").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let metadata_json: String =
        row.try_get("metadata_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at_str: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let amount = amount_str
        .parse::<Decimal>()
        .map_err(|e| RepositoryError::Decode(format!("amount `{amount_str}`: {e}")))?;
    let state = ApState::parse(&state_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown state `{state_str}`")))?;
    let metadata: ItemMetadata = serde_json::from_str(&metadata_json)
        .map_err(|e| RepositoryError::Decode(format!("metadata: {e}")))?;

    let due_date = due_date_str.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok());
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let post_attempted_at = post_attempted_at_str
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(ApItem {
        id: ApItemId(id),
        organization_id: OrganizationId(organization_id),
        invoice_key,
        vendor_name,
        amount,
        currency,
        invoice_number,
        due_date,
        confidence,
        state,
        approval_required,
        post_attempted_at,
        erp_reference,
        metadata,
        created_at,
        updated_at,
    })
}

fn encode_metadata(item: &ApItem) -> Result<String, RepositoryError> {
    serde_json::to_string(&item.metadata)
        .map_err(|e| RepositoryError::Decode(format!("metadata: {e}")))
}

#[async_trait::async_trait]
impl ItemRepository for SqlItemRepository {
    async fn find_by_id(&self, id: &ApItemId) -> Result<Option<ApItem>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM ap_item WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_item(r)?)),
            None => Ok(None),
        }
    }

    async fn insert(&self, item: &ApItem) -> Result<(), RepositoryError> {
        let metadata_json = encode_metadata(item)?;

        sqlx::query(
            "INSERT INTO ap_item
                 (id, organization_id, invoice_key, vendor_name, amount, currency,
                  invoice_number, due_date, confidence, state, approval_required,
                  post_attempted_at, erp_reference, metadata_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id.0)
        .bind(&item.organization_id.0)
        .bind(&item.invoice_key)
        .bind(&item.vendor_name)
        .bind(item.amount.to_string())
        .bind(&item.currency)
        .bind(&item.invoice_number)
        .bind(item.due_date.map(|d| d.to_string()))
        .bind(item.confidence)
        .bind(item.state.as_str())
        .bind(item.approval_required)
        .bind(item.post_attempted_at.map(|dt| dt.to_rfc3339()))
        .bind(&item.erp_reference)
        .bind(&metadata_json)
        .bind(item.created_at.to_rfc3339())
        .bind(item.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_metadata_if_state(
        &self,
        id: &ApItemId,
        metadata: &ItemMetadata,
        expected: ApState,
    ) -> Result<bool, RepositoryError> {
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| RepositoryError::Decode(format!("metadata: {e}")))?;

        let result =
            sqlx::query("UPDATE ap_item SET metadata_json = ? WHERE id = ? AND state = ?")
                .bind(&metadata_json)
                .bind(&id.0)
                .bind(expected.as_str())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_if_state(
        &self,
        item: &ApItem,
        expected: ApState,
    ) -> Result<bool, RepositoryError> {
        let metadata_json = encode_metadata(item)?;

        let result = sqlx::query(
            "UPDATE ap_item SET
                 state = ?,
                 approval_required = ?,
                 post_attempted_at = ?,
                 erp_reference = ?,
                 metadata_json = ?,
                 updated_at = ?
             WHERE id = ? AND state = ?",
        )
        .bind(item.state.as_str())
        .bind(item.approval_required)
        .bind(item.post_attempted_at.map(|dt| dt.to_rfc3339()))
        .bind(&item.erp_reference)
        .bind(&metadata_json)
        .bind(item.updated_at.to_rfc3339())
        .bind(&item.id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_open_by_vendor_invoice(
        &self,
        organization_id: &OrganizationId,
        vendor_name: &str,
        invoice_number: &str,
    ) -> Result<Vec<ApItem>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM ap_item
             WHERE organization_id = ?
               AND state NOT IN ('closed', 'rejected')
               AND LOWER(TRIM(vendor_name)) = LOWER(TRIM(?))
               AND LOWER(TRIM(COALESCE(invoice_number, ''))) = LOWER(TRIM(?))
             ORDER BY created_at ASC"
        ))
        .bind(&organization_id.0)
        .bind(vendor_name)
        .bind(invoice_number)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    async fn list_open(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<ApItem>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM ap_item
             WHERE organization_id = ? AND state NOT IN ('closed', 'rejected')
             ORDER BY created_at ASC"
        ))
        .bind(&organization_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    async fn list_by_state(&self, state: ApState) -> Result<Vec<ApItem>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM ap_item WHERE state = ? ORDER BY updated_at ASC"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }

    async fn merge_items(
        &self,
        target_id: &ApItemId,
        closed_source: &ApItem,
    ) -> Result<(), RepositoryError> {
        let metadata_json = encode_metadata(closed_source)?;
        let mut tx = self.pool.begin().await?;

        // Reassign sources; pairs already present on the target are dropped
        // rather than duplicated.
        sqlx::query("UPDATE OR IGNORE ap_source SET ap_item_id = ? WHERE ap_item_id = ?")
            .bind(&target_id.0)
            .bind(&closed_source.id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM ap_source WHERE ap_item_id = ?")
            .bind(&closed_source.id.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE OR IGNORE ap_item_attachment SET ap_item_id = ? WHERE ap_item_id = ?",
        )
        .bind(&target_id.0)
        .bind(&closed_source.id.0)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM ap_item_attachment WHERE ap_item_id = ?")
            .bind(&closed_source.id.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE ap_item SET state = ?, metadata_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(closed_source.state.as_str())
        .bind(&metadata_json)
        .bind(closed_source.updated_at.to_rfc3339())
        .bind(&closed_source.id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn split_item(
        &self,
        new_item: &ApItem,
        moved_sources: &[SourceId],
    ) -> Result<(), RepositoryError> {
        let metadata_json = encode_metadata(new_item)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO ap_item
                 (id, organization_id, invoice_key, vendor_name, amount, currency,
                  invoice_number, due_date, confidence, state, approval_required,
                  post_attempted_at, erp_reference, metadata_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new_item.id.0)
        .bind(&new_item.organization_id.0)
        .bind(&new_item.invoice_key)
        .bind(&new_item.vendor_name)
        .bind(new_item.amount.to_string())
        .bind(&new_item.currency)
        .bind(&new_item.invoice_number)
        .bind(new_item.due_date.map(|d| d.to_string()))
        .bind(new_item.confidence)
        .bind(new_item.state.as_str())
        .bind(new_item.approval_required)
        .bind(new_item.post_attempted_at.map(|dt| dt.to_rfc3339()))
        .bind(&new_item.erp_reference)
        .bind(&metadata_json)
        .bind(new_item.created_at.to_rfc3339())
        .bind(new_item.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for source_id in moved_sources {
            sqlx::query("UPDATE ap_source SET ap_item_id = ? WHERE id = ?")
                .bind(&new_item.id.0)
                .bind(&source_id.0)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
