use chrono::{DateTime, Utc};
use sqlx::Row;

use apflow_core::audit::{ActorType, AuditEvent};
use apflow_core::domain::item::{ApItemId, ApState, OrganizationId};

use super::{AppendOutcome, AuditLedger, RepositoryError};
use crate::DbPool;

pub struct SqlAuditLedger {
    pool: DbPool,
}

impl SqlAuditLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const EVENT_COLUMNS: &str = "id, ap_item_id, organization_id, event_type, from_state, to_state,
     actor_type, actor_id, payload_json, external_refs_json, idempotency_key, occurred_at";

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let ap_item_id: String =
        row.try_get("ap_item_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let organization_id: String =
        row.try_get("organization_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let event_type: String =
        row.try_get("event_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let from_state_str: Option<String> =
        row.try_get("from_state").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let to_state_str: Option<String> =
        row.try_get("to_state").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let actor_type_str: String =
        row.try_get("actor_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let actor_id: String =
        row.try_get("actor_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let payload_json: String =
        row.try_get("payload_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let external_refs_json: String =
        row.try_get("external_refs_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let idempotency_key: String =
        row.try_get("idempotency_key").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let occurred_at_str: String =
        row.try_get("occurred_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let actor_type = ActorType::parse(&actor_type_str)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown actor type `{actor_type_str}`")))?;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| RepositoryError::Decode(format!("payload: {e}")))?;
    let external_refs = serde_json::from_str(&external_refs_json)
        .map_err(|e| RepositoryError::Decode(format!("external refs: {e}")))?;
    let occurred_at = DateTime::parse_from_rfc3339(&occurred_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(AuditEvent {
        id,
        ap_item_id: ApItemId(ap_item_id),
        organization_id: OrganizationId(organization_id),
        event_type,
        from_state: from_state_str.as_deref().and_then(ApState::parse),
        to_state: to_state_str.as_deref().and_then(ApState::parse),
        actor_type,
        actor_id,
        payload,
        external_refs,
        idempotency_key,
        occurred_at,
    })
}

#[async_trait::async_trait]
impl AuditLedger for SqlAuditLedger {
    async fn append(&self, event: AuditEvent) -> Result<AppendOutcome, RepositoryError> {
        let payload_json = serde_json::to_string(&event.payload)
            .map_err(|e| RepositoryError::Decode(format!("payload: {e}")))?;
        let external_refs_json = serde_json::to_string(&event.external_refs)
            .map_err(|e| RepositoryError::Decode(format!("external refs: {e}")))?;

        let result = sqlx::query(
            "INSERT INTO audit_event
                 (id, ap_item_id, organization_id, event_type, from_state, to_state,
                  actor_type, actor_id, payload_json, external_refs_json,
                  idempotency_key, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(&event.id)
        .bind(&event.ap_item_id.0)
        .bind(&event.organization_id.0)
        .bind(&event.event_type)
        .bind(event.from_state.map(|s| s.as_str()))
        .bind(event.to_state.map(|s| s.as_str()))
        .bind(event.actor_type.as_str())
        .bind(&event.actor_id)
        .bind(&payload_json)
        .bind(&external_refs_json)
        .bind(&event.idempotency_key)
        .bind(event.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(AppendOutcome::Appended(event));
        }

        let existing = self
            .find_by_idempotency_key(&event.idempotency_key)
            .await?
            .ok_or_else(|| {
                RepositoryError::Decode(format!(
                    "idempotency key `{}` conflicted but no row was found",
                    event.idempotency_key
                ))
            })?;
        Ok(AppendOutcome::Duplicate(existing))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<AuditEvent>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM audit_event WHERE idempotency_key = ?"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_event(r)?)),
            None => Ok(None),
        }
    }

    async fn list_for_item(&self, id: &ApItemId) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM audit_event
             WHERE ap_item_id = ? ORDER BY occurred_at ASC, id ASC"
        ))
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn list_for_organization(
        &self,
        organization_id: &OrganizationId,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM audit_event
             WHERE organization_id = ? ORDER BY occurred_at DESC, id DESC LIMIT ?"
        ))
        .bind(&organization_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }
}
