use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

use apflow_core::config::{AppConfig, ConfigError, LoadOptions};
use apflow_core::correlation::CorrelationConfig;
use apflow_core::reconciler::SlaConfig;
use apflow_db::{
    connect_with_settings, migrations, DbPool, SqlAuditLedger, SqlItemRepository,
    SqlPolicyRepository, SqlSourceRepository,
};

use crate::erp::{ErpPoster, HttpErpPoster, NoopErpPoster};
use crate::intake::IntakeService;
use crate::notify::TracingNotifier;
use crate::reconciler::Reconciler;
use crate::workflow::WorkflowService;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub workflow: Arc<WorkflowService>,
    pub intake: Arc<IntakeService>,
    pub reconciler: Arc<Reconciler>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let items = Arc::new(SqlItemRepository::new(db_pool.clone()));
    let sources = Arc::new(SqlSourceRepository::new(db_pool.clone()));
    let ledger = Arc::new(SqlAuditLedger::new(db_pool.clone()));
    let policies = Arc::new(SqlPolicyRepository::new(db_pool.clone()));

    let erp: Arc<dyn ErpPoster> = match HttpErpPoster::from_config(&config.erp) {
        Some(poster) => Arc::new(poster),
        None => {
            info!(
                event_name = "system.bootstrap.erp_noop",
                correlation_id = "bootstrap",
                "no erp base url configured, posting runs in noop mode"
            );
            Arc::new(NoopErpPoster)
        }
    };
    let notifier = Arc::new(TracingNotifier);

    let workflow = Arc::new(WorkflowService::new(
        items.clone(),
        sources.clone(),
        ledger.clone(),
        policies,
        erp,
        notifier.clone(),
        config.intake.auto_approval_threshold,
        config.sla.approval_sla_minutes,
    ));

    let correlation = CorrelationConfig {
        amount_tolerance: config
            .correlation
            .amount_tolerance
            .parse::<Decimal>()
            .unwrap_or_else(|_| CorrelationConfig::default().amount_tolerance),
        attachment_lookback_days: config.correlation.attachment_lookback_days,
    };
    let intake = Arc::new(IntakeService::new(
        items.clone(),
        sources,
        ledger.clone(),
        workflow.clone(),
        correlation,
        config.intake.max_concurrency,
    ));

    let reconciler = Arc::new(Reconciler::new(
        items,
        ledger,
        notifier,
        SlaConfig {
            approval_sla_minutes: config.sla.approval_sla_minutes,
            interval_secs: config.sla.interval_secs,
        },
    ));

    Ok(Application { config, db_pool, workflow, intake, reconciler })
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use apflow_core::config::{ConfigOverrides, LoadOptions};
    use apflow_core::correlation::Detection;
    use apflow_core::domain::item::{ApState, OrganizationId};
    use apflow_core::domain::source::{SourceDescriptor, SourceType};

    use crate::bootstrap::bootstrap;
    use crate::intake::IntakeOutcome;

    fn valid_overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                webhook_secret: Some("wh-test-secret".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_without_webhook_secret() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(result.is_err());
        let message = result.err().expect("error").to_string();
        assert!(message.contains("webhook.secret"));
    }

    #[tokio::test]
    async fn integration_smoke_covers_startup_and_intake_data_path() {
        let app = bootstrap(valid_overrides("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed with valid overrides");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN \
             ('ap_item', 'ap_source', 'audit_event', 'policy_document')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("expected foundation tables to be available after bootstrap");
        assert_eq!(table_count, 4, "bootstrap should expose baseline ap-path tables");

        let outcome = app
            .intake
            .process_detection(
                &OrganizationId("org-1".to_string()),
                Detection {
                    vendor_name: "Initech Supplies".to_string(),
                    amount: Decimal::new(321_00, 2),
                    currency: "USD".to_string(),
                    invoice_number: Some("INV-BOOT-1".to_string()),
                    due_date: None,
                    confidence: 0.95,
                    attachment_hashes: Vec::new(),
                    source: SourceDescriptor {
                        source_type: SourceType::GmailThread,
                        source_ref: "thread-boot-1".to_string(),
                        subject: None,
                        sender: None,
                    },
                },
            )
            .await
            .expect("intake through sql repositories");

        let IntakeOutcome::Created { item, .. } = outcome else {
            panic!("expected a created item");
        };
        assert_eq!(item.state, ApState::ReadyToPost);

        let reloaded = app.workflow.load(&item.id).await.expect("reload");
        assert_eq!(reloaded.state, ApState::ReadyToPost);

        app.db_pool.close().await;
    }
}
