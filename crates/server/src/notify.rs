//! Notification seams. Delivery transports (chat, email) are external
//! collaborators; the default implementation only logs.

use async_trait::async_trait;

use apflow_core::domain::item::ApItem;
use apflow_core::router::ApprovalRoute;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_approval_needed(&self, item: &ApItem, route: &ApprovalRoute);

    async fn notify_escalation(&self, item: &ApItem, stale_for_minutes: i64);
}

#[derive(Clone, Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify_approval_needed(&self, item: &ApItem, route: &ApprovalRoute) {
        tracing::info!(
            event_name = "workflow.notify.approval_needed",
            ap_item_id = %item.id.0,
            organization_id = %item.organization_id.0,
            approvers = ?route.approvers,
            reason = %route.reason_summary,
            "approval requested"
        );
    }

    async fn notify_escalation(&self, item: &ApItem, stale_for_minutes: i64) {
        tracing::warn!(
            event_name = "reconciler.notify.escalation",
            ap_item_id = %item.id.0,
            organization_id = %item.organization_id.0,
            stale_for_minutes,
            "approval sla breached"
        );
    }
}

#[cfg(test)]
pub mod fakes {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use apflow_core::domain::item::ApItem;
    use apflow_core::router::ApprovalRoute;

    use super::Notifier;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub approval_requests: Mutex<Vec<String>>,
        pub escalations: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        pub fn escalation_count(&self) -> usize {
            self.escalations.lock().map(|entries| entries.len()).unwrap_or(0)
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_approval_needed(&self, item: &ApItem, _route: &ApprovalRoute) {
            if let Ok(mut requests) = self.approval_requests.lock() {
                requests.push(item.id.0.clone());
            }
        }

        async fn notify_escalation(&self, item: &ApItem, _stale_for_minutes: i64) {
            if let Ok(mut escalations) = self.escalations.lock() {
                escalations.push(item.id.0.clone());
            }
        }
    }
}
