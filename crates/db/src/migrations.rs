use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::connect_with_settings;

    const MANAGED_SCHEMA_OBJECTS: &[&str] = &[
        "ap_item",
        "ap_source",
        "ap_item_attachment",
        "audit_event",
        "policy_document",
        "idx_ap_item_org_state",
        "idx_ap_item_invoice_key",
        "idx_ap_item_vendor_invoice",
        "idx_ap_source_item_id",
        "idx_ap_item_attachment_hash",
        "idx_audit_event_item_id",
        "idx_audit_event_org",
        "idx_audit_event_type",
        "idx_policy_document_enabled",
    ];

    #[tokio::test]
    async fn migrations_create_all_managed_objects() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        for object in MANAGED_SCHEMA_OBJECTS {
            let count = sqlx::query(
                "SELECT COUNT(*) AS count FROM sqlite_master
                 WHERE type IN ('table', 'index') AND name = ?",
            )
            .bind(object)
            .fetch_one(&pool)
            .await
            .expect("query sqlite_master")
            .get::<i64, _>("count");

            assert_eq!(count, 1, "schema object `{object}` should exist");
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("first run");
        run_pending(&pool).await.expect("second run");
    }

    #[tokio::test]
    async fn audit_idempotency_key_is_unique() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let insert = "INSERT INTO audit_event
             (id, ap_item_id, organization_id, event_type, actor_type, actor_id,
              payload_json, external_refs_json, idempotency_key, occurred_at)
             VALUES (?, 'item-1', 'org-1', 'created', 'system', 'test', '{}', '{}', ?, ?)";

        sqlx::query(insert)
            .bind("evt-1")
            .bind("created:item-1")
            .bind("2026-01-01T00:00:00Z")
            .execute(&pool)
            .await
            .expect("first insert");

        let duplicate = sqlx::query(insert)
            .bind("evt-2")
            .bind("created:item-1")
            .bind("2026-01-01T00:00:01Z")
            .execute(&pool)
            .await;

        assert!(duplicate.is_err(), "duplicate idempotency key must be rejected");
    }
}
