mod api;
mod bootstrap;
mod erp;
mod health;
mod intake;
mod notify;
mod reconciler;
mod workflow;

use anyhow::Result;
use apflow_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use apflow_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
    )
    .await?;

    tokio::spawn(app.reconciler.clone().run());
    tracing::info!(
        event_name = "system.server.reconciler_started",
        correlation_id = "bootstrap",
        interval_secs = app.config.sla.interval_secs,
        "sla reconciler started"
    );

    let state = api::AppState {
        workflow: app.workflow.clone(),
        intake: app.intake.clone(),
        webhook_secret: app.config.webhook.secret.clone(),
    };

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        "apflow-server started"
    );
    api::serve(&app.config.server.bind_address, app.config.server.port, state).await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "apflow-server stopping"
    );

    Ok(())
}
