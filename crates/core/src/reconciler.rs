//! SLA escalation pass: finds items stuck in `needs_approval` past the
//! configured deadline. The escalation key is stable across runs, so the
//! ledger's unique-key constraint makes repeated passes emit at most one
//! event per breach.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{ActorType, AuditEvent};
use crate::domain::item::{ApItem, ApState};
use crate::lifecycle::states::event_types;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlaConfig {
    /// Minutes an item may sit in `needs_approval` before escalation.
    pub approval_sla_minutes: i64,
    /// How often the background pass runs.
    pub interval_secs: u64,
}

impl Default for SlaConfig {
    fn default() -> Self {
        Self { approval_sla_minutes: 24 * 60, interval_secs: 300 }
    }
}

/// One breach found by a pass. The audit event is pre-built; the caller
/// appends it and notifies only when the append was fresh.
#[derive(Clone, Debug, PartialEq)]
pub struct Escalation {
    pub item: ApItem,
    pub stale_for_minutes: i64,
    pub event: AuditEvent,
}

pub fn escalation_key(item: &ApItem, sla_minutes: i64) -> String {
    format!("approval_escalated:{}:{}", item.id.0, sla_minutes)
}

/// Scan one batch of items and return the breaches. Items not in
/// `needs_approval` or still inside the SLA window are skipped.
pub fn find_escalations(
    items: &[ApItem],
    config: &SlaConfig,
    now: DateTime<Utc>,
) -> Vec<Escalation> {
    let deadline = Duration::minutes(config.approval_sla_minutes);

    items
        .iter()
        .filter(|item| item.state == ApState::NeedsApproval)
        .filter(|item| now - item.updated_at > deadline)
        .map(|item| {
            let stale_for_minutes = (now - item.updated_at).num_minutes();
            let event = AuditEvent::new(
                item.id.clone(),
                item.organization_id.clone(),
                event_types::APPROVAL_ESCALATED,
                ActorType::Reconciler,
                "sla-reconciler",
                escalation_key(item, config.approval_sla_minutes),
            )
            .with_payload(json!({
                "sla_minutes": config.approval_sla_minutes,
                "stale_for_minutes": stale_for_minutes,
                "vendor_name": item.vendor_name,
                "amount": item.amount.to_string(),
            }));

            Escalation { item: item.clone(), stale_for_minutes, event }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use crate::domain::item::{
        ApItem, ApItemId, ApState, ItemMetadata, OrganizationId,
    };

    use super::{escalation_key, find_escalations, SlaConfig};

    fn stale_item(id: &str, state: ApState, stale_minutes: i64) -> ApItem {
        let now = Utc::now();
        ApItem {
            id: ApItemId(id.to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            invoice_key: String::new(),
            vendor_name: "Initech Supplies".to_string(),
            amount: Decimal::new(100_00, 2),
            currency: "USD".to_string(),
            invoice_number: None,
            due_date: None,
            confidence: 0.70,
            state,
            approval_required: true,
            post_attempted_at: None,
            erp_reference: None,
            metadata: ItemMetadata::default(),
            created_at: now - Duration::minutes(stale_minutes),
            updated_at: now - Duration::minutes(stale_minutes),
        }
    }

    #[test]
    fn stale_needs_approval_items_are_escalated() {
        let config = SlaConfig { approval_sla_minutes: 60, interval_secs: 300 };
        let items = [
            stale_item("fresh", ApState::NeedsApproval, 10),
            stale_item("stale", ApState::NeedsApproval, 120),
            stale_item("closed", ApState::Closed, 500),
        ];

        let escalations = find_escalations(&items, &config, Utc::now());

        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].item.id.0, "stale");
        assert_eq!(escalations[0].event.idempotency_key, "approval_escalated:stale:60");
    }

    #[test]
    fn escalation_key_is_stable_across_passes() {
        let item = stale_item("item-1", ApState::NeedsApproval, 120);
        let config = SlaConfig { approval_sla_minutes: 60, interval_secs: 300 };

        let first = find_escalations(std::slice::from_ref(&item), &config, Utc::now());
        let second = find_escalations(std::slice::from_ref(&item), &config, Utc::now());

        assert_eq!(first[0].event.idempotency_key, second[0].event.idempotency_key);
        assert_eq!(first[0].event.idempotency_key, escalation_key(&item, 60));
    }
}
