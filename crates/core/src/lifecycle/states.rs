use serde::{Deserialize, Serialize};

use crate::audit::{ActorType, AuditEvent};
use crate::domain::item::{ApItem, ApState};

/// Event type strings written to the audit ledger, one per transition.
pub mod event_types {
    pub const CREATED: &str = "created";
    pub const VALIDATED: &str = "validated";
    pub const READY_TO_POST: &str = "ready_to_post";
    pub const APPROVED: &str = "approved";
    pub const REJECTED: &str = "rejected";
    pub const POSTED: &str = "posted";
    pub const POST_FAILED: &str = "post_failed";
    pub const POST_RETRY: &str = "post_retry";
    pub const DETECTION_MERGED: &str = "detection_merged";
    pub const CONTEXT_CONFLICT: &str = "context_conflict";
    pub const ITEMS_MERGED: &str = "items_merged";
    pub const ITEM_SPLIT: &str = "item_split";
    pub const APPROVAL_ESCALATED: &str = "approval_escalated";
    pub const APPROVAL_CALLBACK_REJECTED: &str = "approval_callback_rejected";
}

/// Who is asking for a transition and under which idempotency key. The key
/// must derive from durable identifiers of the triggering action, never from
/// wall-clock time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionContext {
    pub actor_type: ActorType,
    pub actor_id: String,
    pub idempotency_key: String,
}

impl ActionContext {
    pub fn new(
        actor_type: ActorType,
        actor_id: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self { actor_type, actor_id: actor_id.into(), idempotency_key: idempotency_key.into() }
    }

    pub fn system(idempotency_key: impl Into<String>) -> Self {
        Self::new(ActorType::System, "transition-engine", idempotency_key)
    }
}

/// An applied transition: the updated item plus the single audit event that
/// records it. The caller persists both.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionOutcome {
    pub item: ApItem,
    pub event: AuditEvent,
}

impl TransitionOutcome {
    pub fn from_state(&self) -> Option<ApState> {
        self.event.from_state
    }

    pub fn to_state(&self) -> Option<ApState> {
        self.event.to_state
    }
}

/// Approval request details carried into the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub actor_id: String,
    pub justification: Option<String>,
    /// Whether the validation gate had passed for this item; when it has
    /// not, a justification is mandatory (human override path).
    pub gate_passed: bool,
    pub required_approvers: Vec<String>,
}
