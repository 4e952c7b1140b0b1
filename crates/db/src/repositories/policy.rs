use chrono::{DateTime, Utc};
use sqlx::Row;

use apflow_core::domain::item::OrganizationId;
use apflow_core::domain::policy::{EffectivePolicy, PolicyConfig, PolicyDocument};

use super::{PolicyRepository, RepositoryError};
use crate::DbPool;

pub struct SqlPolicyRepository {
    pool: DbPool,
}

impl SqlPolicyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<PolicyDocument, RepositoryError> {
    let organization_id: String =
        row.try_get("organization_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let policy_name: String =
        row.try_get("policy_name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let version: i64 =
        row.try_get("version").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let config_json: String =
        row.try_get("config_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let enabled: bool =
        row.try_get("enabled").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_by: String =
        row.try_get("updated_by").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at_str: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let config: PolicyConfig = serde_json::from_str(&config_json)
        .map_err(|e| RepositoryError::Decode(format!("config: {e}")))?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    Ok(PolicyDocument {
        organization_id: OrganizationId(organization_id),
        policy_name,
        version,
        config,
        enabled,
        updated_by,
        created_at,
    })
}

#[async_trait::async_trait]
impl PolicyRepository for SqlPolicyRepository {
    async fn effective(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
    ) -> Result<EffectivePolicy, RepositoryError> {
        let row = sqlx::query(
            "SELECT organization_id, policy_name, version, config_json, enabled,
                    updated_by, created_at
             FROM policy_document
             WHERE organization_id = ? AND policy_name = ? AND enabled = 1
             ORDER BY version DESC
             LIMIT 1",
        )
        .bind(&organization_id.0)
        .bind(policy_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(EffectivePolicy::Configured(row_to_document(r)?)),
            None => Ok(EffectivePolicy::BuiltInDefault(PolicyDocument::built_in_default(
                organization_id.clone(),
                policy_name,
            ))),
        }
    }

    async fn put_version(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
        config: PolicyConfig,
        updated_by: &str,
        enabled: bool,
    ) -> Result<PolicyDocument, RepositoryError> {
        let config_json = serde_json::to_string(&config)
            .map_err(|e| RepositoryError::Decode(format!("config: {e}")))?;
        let created_at = Utc::now();

        // Version assignment and insert share one transaction so concurrent
        // writers cannot claim the same number.
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS current FROM policy_document
             WHERE organization_id = ? AND policy_name = ?",
        )
        .bind(&organization_id.0)
        .bind(policy_name)
        .fetch_one(&mut *tx)
        .await?;
        let version: i64 =
            row.try_get::<i64, _>("current").map_err(|e| RepositoryError::Decode(e.to_string()))?
                + 1;

        sqlx::query(
            "INSERT INTO policy_document
                 (organization_id, policy_name, version, config_json, enabled,
                  updated_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&organization_id.0)
        .bind(policy_name)
        .bind(version)
        .bind(&config_json)
        .bind(enabled)
        .bind(updated_by)
        .bind(created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(PolicyDocument {
            organization_id: organization_id.clone(),
            policy_name: policy_name.to_string(),
            version,
            config,
            enabled,
            updated_by: updated_by.to_string(),
            created_at,
        })
    }

    async fn list_versions(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
    ) -> Result<Vec<PolicyDocument>, RepositoryError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT organization_id, policy_name, version, config_json, enabled,
                    updated_by, created_at
             FROM policy_document
             WHERE organization_id = ? AND policy_name = ?
             ORDER BY version DESC",
        )
        .bind(&organization_id.0)
        .bind(policy_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use apflow_core::domain::item::OrganizationId;
    use apflow_core::domain::policy::{PolicyConfig, DEFAULT_POLICY_NAME};

    use super::SqlPolicyRepository;
    use crate::repositories::PolicyRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlPolicyRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlPolicyRepository::new(pool)
    }

    fn org() -> OrganizationId {
        OrganizationId("org-1".to_string())
    }

    fn config_with_rule() -> PolicyConfig {
        PolicyConfig {
            rules: vec![json!({
                "type": "amount_threshold",
                "policy_id": "amount-10k",
                "threshold": "10000",
                "action": "require_approval",
                "required_approvers": ["finance_manager"]
            })],
            ..PolicyConfig::default()
        }
    }

    #[tokio::test]
    async fn missing_policy_falls_back_to_built_in_default() {
        let repo = setup().await;

        let effective = repo.effective(&org(), DEFAULT_POLICY_NAME).await.expect("effective");

        assert!(!effective.is_configured());
        assert_eq!(effective.document().version, 0);
    }

    #[tokio::test]
    async fn versions_increase_monotonically() {
        let repo = setup().await;

        let v1 = repo
            .put_version(&org(), DEFAULT_POLICY_NAME, PolicyConfig::default(), "admin", true)
            .await
            .expect("put v1");
        let v2 = repo
            .put_version(&org(), DEFAULT_POLICY_NAME, config_with_rule(), "admin", true)
            .await
            .expect("put v2");

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let effective = repo.effective(&org(), DEFAULT_POLICY_NAME).await.expect("effective");
        assert!(effective.is_configured());
        assert_eq!(effective.document().version, 2);
        assert_eq!(effective.document().config.rules.len(), 1);
    }

    #[tokio::test]
    async fn disabled_latest_version_is_skipped() {
        let repo = setup().await;

        repo.put_version(&org(), DEFAULT_POLICY_NAME, config_with_rule(), "admin", true)
            .await
            .expect("put v1");
        repo.put_version(&org(), DEFAULT_POLICY_NAME, PolicyConfig::default(), "admin", false)
            .await
            .expect("put disabled v2");

        let effective = repo.effective(&org(), DEFAULT_POLICY_NAME).await.expect("effective");

        assert!(effective.is_configured());
        assert_eq!(effective.document().version, 1);
    }

    #[tokio::test]
    async fn version_history_is_append_only_per_policy_name() {
        let repo = setup().await;

        repo.put_version(&org(), DEFAULT_POLICY_NAME, PolicyConfig::default(), "admin", true)
            .await
            .expect("put ap v1");
        repo.put_version(&org(), "expense_policy", PolicyConfig::default(), "admin", true)
            .await
            .expect("put expense v1");
        repo.put_version(&org(), DEFAULT_POLICY_NAME, config_with_rule(), "admin", true)
            .await
            .expect("put ap v2");

        let versions =
            repo.list_versions(&org(), DEFAULT_POLICY_NAME).await.expect("list versions");

        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, 2);
        assert_eq!(versions[1].version, 1);
    }
}
