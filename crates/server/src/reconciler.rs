//! Background SLA pass. Every interval the reconciler scans items stuck in
//! `needs_approval` and escalates the stale ones. The escalation key is
//! stable per item and SLA, so the ledger's unique key makes repeated
//! passes notify at most once per breach.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use apflow_core::domain::item::ApState;
use apflow_core::reconciler::{find_escalations, SlaConfig};
use apflow_db::{AuditLedger, ItemRepository};

use crate::notify::Notifier;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcilerReport {
    pub scanned: usize,
    pub escalated: usize,
    pub notified: usize,
    pub errors: usize,
}

pub struct Reconciler {
    items: Arc<dyn ItemRepository>,
    ledger: Arc<dyn AuditLedger>,
    notifier: Arc<dyn Notifier>,
    config: SlaConfig,
}

impl Reconciler {
    pub fn new(
        items: Arc<dyn ItemRepository>,
        ledger: Arc<dyn AuditLedger>,
        notifier: Arc<dyn Notifier>,
        config: SlaConfig,
    ) -> Self {
        Self { items, ledger, notifier, config }
    }

    /// Run forever. Per-item failures are counted and logged; the loop
    /// itself never exits.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let report = self.run_once().await;
            tracing::debug!(
                event_name = "reconciler.pass_complete",
                scanned = report.scanned,
                escalated = report.escalated,
                notified = report.notified,
                errors = report.errors,
                "sla pass finished"
            );
        }
    }

    pub async fn run_once(&self) -> ReconcilerReport {
        let mut report = ReconcilerReport::default();

        let pending = match self.items.list_by_state(ApState::NeedsApproval).await {
            Ok(pending) => pending,
            Err(error) => {
                report.errors += 1;
                tracing::warn!(
                    event_name = "reconciler.scan_failed",
                    error = %error,
                    "could not list pending approvals"
                );
                return report;
            }
        };
        report.scanned = pending.len();

        for escalation in find_escalations(&pending, &self.config, Utc::now()) {
            report.escalated += 1;
            match self.ledger.append(escalation.event.clone()).await {
                Ok(outcome) if outcome.is_fresh() => {
                    self.notifier
                        .notify_escalation(&escalation.item, escalation.stale_for_minutes)
                        .await;
                    report.notified += 1;
                }
                Ok(_) => {
                    // Already escalated by an earlier pass.
                }
                Err(error) => {
                    report.errors += 1;
                    tracing::warn!(
                        event_name = "reconciler.escalation_failed",
                        ap_item_id = %escalation.item.id.0,
                        error = %error,
                        "could not record escalation"
                    );
                }
            }
        }
        report
    }
}
