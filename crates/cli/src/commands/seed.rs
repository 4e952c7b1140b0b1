use chrono::Utc;
use rust_decimal::Decimal;

use crate::commands::CommandResult;
use apflow_core::audit::{ActorType, AuditEvent};
use apflow_core::config::{AppConfig, LoadOptions};
use apflow_core::correlation;
use apflow_core::domain::item::{ApItem, ApItemId, ApState, ItemMetadata, OrganizationId};
use apflow_core::lifecycle::event_types;
use apflow_db::{
    connect_with_settings, migrations, AuditLedger, ItemRepository, SqlAuditLedger,
    SqlItemRepository,
};

const DEMO_ORGANIZATION: &str = "org-demo";

struct DemoFlow {
    flow_type: &'static str,
    item_id: &'static str,
    description: &'static str,
}

const DEMO_FLOWS: [DemoFlow; 3] = [
    DemoFlow {
        flow_type: "auto_post",
        item_id: "demo-auto-001",
        description: "High confidence invoice - closed state",
    },
    DemoFlow {
        flow_type: "approval",
        item_id: "demo-approval-001",
        description: "Low confidence invoice - needs_approval state",
    },
    DemoFlow {
        flow_type: "retry",
        item_id: "demo-retry-001",
        description: "ERP outage during posting - failed_post state",
    },
];

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "seed",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let items = SqlItemRepository::new(pool.clone());
        let ledger = SqlAuditLedger::new(pool.clone());

        let run_result = load_fixtures(&items, &ledger)
            .await
            .map_err(|error| ("seed_execution", error, 5u8));
        let verify_result = match run_result {
            Ok(()) => verify_fixtures(&items).await.map_err(|error| ("seed_verification", error, 6u8)),
            Err(error) => Err(error),
        };

        pool.close().await;
        verify_result
    });

    match result {
        Ok(()) => {
            let flow_lines: Vec<String> = DEMO_FLOWS
                .iter()
                .map(|flow| format!("  - {}: {} ({})", flow.flow_type, flow.item_id, flow.description))
                .collect();
            let message = format!(
                "Demo dataset loaded for 3 core ap flows:\n{}",
                flow_lines.join("\n")
            );
            CommandResult::success("seed", message)
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

async fn load_fixtures(
    items: &SqlItemRepository,
    ledger: &SqlAuditLedger,
) -> Result<(), String> {
    for item in fixtures() {
        let existing = items
            .find_by_id(&item.id)
            .await
            .map_err(|error| format!("lookup of `{}` failed: {error}", item.id.0))?;
        if existing.is_none() {
            items
                .insert(&item)
                .await
                .map_err(|error| format!("insert of `{}` failed: {error}", item.id.0))?;
        }

        // The ledger key is unique, so re-running seed never writes a second row.
        let event = AuditEvent::new(
            item.id.clone(),
            item.organization_id.clone(),
            event_types::CREATED,
            ActorType::System,
            "seed",
            format!("seed:{}", item.id.0),
        )
        .with_states(None, Some(item.state));
        ledger
            .append(event)
            .await
            .map_err(|error| format!("audit event for `{}` failed: {error}", item.id.0))?;
    }
    Ok(())
}

async fn verify_fixtures(items: &SqlItemRepository) -> Result<(), String> {
    let mut missing = Vec::new();
    for flow in &DEMO_FLOWS {
        let found = items
            .find_by_id(&ApItemId(flow.item_id.to_string()))
            .await
            .map_err(|error| format!("verification lookup failed: {error}"))?;
        if found.is_none() {
            missing.push(flow.item_id);
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("seed verification failed for items: {}", missing.join(", ")))
    }
}

fn fixtures() -> Vec<ApItem> {
    let now = Utc::now();
    let base = |id: &str, invoice_number: &str, amount: Decimal, confidence: f64| ApItem {
        id: ApItemId(id.to_string()),
        organization_id: OrganizationId(DEMO_ORGANIZATION.to_string()),
        invoice_key: correlation::invoice_key(
            "Initech Supplies",
            Some(invoice_number),
            amount,
            None,
        ),
        vendor_name: "Initech Supplies".to_string(),
        amount,
        currency: "USD".to_string(),
        invoice_number: Some(invoice_number.to_string()),
        due_date: None,
        confidence,
        state: ApState::Received,
        approval_required: false,
        post_attempted_at: None,
        erp_reference: None,
        metadata: ItemMetadata::default(),
        created_at: now,
        updated_at: now,
    };

    let mut auto = base("demo-auto-001", "INV-DEMO-1", Decimal::new(420_00, 2), 0.97);
    auto.state = ApState::Closed;
    auto.post_attempted_at = Some(now);
    auto.erp_reference = Some("ERP-DEMO-001".to_string());

    let mut approval = base("demo-approval-001", "INV-DEMO-2", Decimal::new(8_750_00, 2), 0.58);
    approval.state = ApState::NeedsApproval;
    approval.approval_required = true;

    let mut retry = base("demo-retry-001", "INV-DEMO-3", Decimal::new(1_299_00, 2), 0.93);
    retry.state = ApState::FailedPost;
    retry.post_attempted_at = Some(now);

    vec![auto, approval, retry]
}
