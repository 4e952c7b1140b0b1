use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::item::{ApItemId, ApState, OrganizationId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    System,
    Human,
    Webhook,
    Reconciler,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Human => "human",
            Self::Webhook => "webhook",
            Self::Reconciler => "reconciler",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Self::System),
            "human" => Some(Self::Human),
            "webhook" => Some(Self::Webhook),
            "reconciler" => Some(Self::Reconciler),
            _ => None,
        }
    }
}

/// Append-only ledger entry. Immutable once written; the idempotency key is
/// unique across the ledger, so replaying the same logical action can never
/// produce a second row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub ap_item_id: ApItemId,
    pub organization_id: OrganizationId,
    pub event_type: String,
    pub from_state: Option<ApState>,
    pub to_state: Option<ApState>,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub payload: serde_json::Value,
    pub external_refs: serde_json::Value,
    pub idempotency_key: String,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        ap_item_id: ApItemId,
        organization_id: OrganizationId,
        event_type: impl Into<String>,
        actor_type: ActorType,
        actor_id: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ap_item_id,
            organization_id,
            event_type: event_type.into(),
            from_state: None,
            to_state: None,
            actor_type,
            actor_id: actor_id.into(),
            payload: serde_json::Value::Object(serde_json::Map::new()),
            external_refs: serde_json::Value::Object(serde_json::Map::new()),
            idempotency_key: idempotency_key.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_states(mut self, from: Option<ApState>, to: Option<ApState>) -> Self {
        self.from_state = from;
        self.to_state = to;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_external_refs(mut self, refs: serde_json::Value) -> Self {
        self.external_refs = refs;
        self
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::audit::{ActorType, AuditEvent};
    use crate::domain::item::{ApItemId, ApState, OrganizationId};

    #[test]
    fn builders_fill_states_and_payload() {
        let event = AuditEvent::new(
            ApItemId("item-1".to_string()),
            OrganizationId("org-1".to_string()),
            "validated",
            ActorType::System,
            "transition-engine",
            "validate:item-1",
        )
        .with_states(Some(ApState::Received), Some(ApState::NeedsApproval))
        .with_payload(json!({"reason_codes": ["confidence_below_threshold"]}));

        assert_eq!(event.idempotency_key, "validate:item-1");
        assert_eq!(event.from_state, Some(ApState::Received));
        assert_eq!(event.to_state, Some(ApState::NeedsApproval));
        assert_eq!(event.payload["reason_codes"][0], "confidence_below_threshold");
    }
}
