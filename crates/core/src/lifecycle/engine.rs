//! Transition engine: the only component allowed to move an AP item between
//! lifecycle states. Pure value-level logic; the store applies the matching
//! conditional update so concurrent callers cannot both win.

use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

use crate::audit::AuditEvent;
use crate::domain::item::{ApItem, ApState};
use crate::gate::{GateDecision, GateRoute};
use crate::lifecycle::states::{
    event_types, ActionContext, ApprovalRequest, TransitionOutcome,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    /// The item is not in a state from which this action is legal.
    #[error("invalid_state: cannot {action} from {state:?}")]
    InvalidState { state: ApState, action: &'static str },
    /// A posting attempt has started and no outcome is recorded yet.
    #[error("conflict_post_started: posting in flight, reject refused")]
    ConflictPostStarted,
    /// Approve on a failed gate needs an explicit human justification.
    #[error("override justification required: validation gate did not pass")]
    OverrideJustificationRequired,
    /// The item already carries an ERP reference; no further posting or
    /// retry is allowed.
    #[error("already posted with erp reference {erp_reference}")]
    AlreadyPosted { erp_reference: String },
}

#[derive(Clone, Debug, Default)]
pub struct TransitionEngine;

impl TransitionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Audit event for item creation; the item itself is built by intake.
    pub fn created_event(&self, item: &ApItem, ctx: &ActionContext) -> AuditEvent {
        AuditEvent::new(
            item.id.clone(),
            item.organization_id.clone(),
            event_types::CREATED,
            ctx.actor_type,
            ctx.actor_id.clone(),
            ctx.idempotency_key.clone(),
        )
        .with_states(None, Some(ApState::Received))
        .with_payload(json!({
            "vendor_name": item.vendor_name,
            "amount": item.amount.to_string(),
            "currency": item.currency,
            "invoice_number": item.invoice_number,
        }))
    }

    /// Route a received (or resubmitted) item according to the gate
    /// decision. One `validated` audit event regardless of the route taken.
    pub fn validate(
        &self,
        mut item: ApItem,
        decision: &GateDecision,
        ctx: &ActionContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        if !matches!(item.state, ApState::Received | ApState::NeedsInfo) {
            return Err(TransitionError::InvalidState { state: item.state, action: "validate" });
        }

        let from = item.state;
        let to = match decision.route {
            GateRoute::NeedsInfo => ApState::NeedsInfo,
            GateRoute::ManualApproval => ApState::NeedsApproval,
            GateRoute::AutoAdvance => ApState::Validated,
        };

        item.state = to;
        item.approval_required = matches!(decision.route, GateRoute::ManualApproval);
        item.metadata.required_approvers = decision.required_approvers.clone();
        item.updated_at = Utc::now();

        let event = self
            .event(&item, event_types::VALIDATED, ctx)
            .with_states(Some(from), Some(to))
            .with_payload(json!({
                "passed": decision.passed,
                "route": decision.route,
                "reason_codes": decision.reason_codes,
                "required_approvers": decision.required_approvers,
                "summary": decision.summary,
            }));

        Ok(TransitionOutcome { item, event })
    }

    /// Auto-advance a gate-passed item into the posting queue.
    pub fn mark_ready(
        &self,
        mut item: ApItem,
        ctx: &ActionContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        if item.state != ApState::Validated {
            return Err(TransitionError::InvalidState { state: item.state, action: "mark_ready" });
        }

        item.state = ApState::ReadyToPost;
        item.updated_at = Utc::now();

        let event = self
            .event(&item, event_types::READY_TO_POST, ctx)
            .with_states(Some(ApState::Validated), Some(ApState::ReadyToPost));

        Ok(TransitionOutcome { item, event })
    }

    /// Record one approver's confirmation. The item moves to `ready_to_post`
    /// once every required approver has confirmed; intermediate
    /// confirmations land in `approved`.
    pub fn approve(
        &self,
        mut item: ApItem,
        request: &ApprovalRequest,
        ctx: &ActionContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        if !matches!(item.state, ApState::NeedsApproval | ApState::Approved) {
            return Err(TransitionError::InvalidState { state: item.state, action: "approve" });
        }
        if !request.gate_passed && request.justification.is_none() {
            return Err(TransitionError::OverrideJustificationRequired);
        }

        let from = item.state;
        if !item.metadata.approvals_recorded.contains(&request.actor_id) {
            item.metadata.approvals_recorded.push(request.actor_id.clone());
        }

        let outstanding: Vec<&String> = request
            .required_approvers
            .iter()
            .filter(|approver| !item.metadata.approvals_recorded.contains(approver))
            .collect();

        let to = if outstanding.is_empty() { ApState::ReadyToPost } else { ApState::Approved };
        item.state = to;
        item.updated_at = Utc::now();

        let event = self
            .event(&item, event_types::APPROVED, ctx)
            .with_states(Some(from), Some(to))
            .with_payload(json!({
                "actor_id": request.actor_id,
                "justification": request.justification,
                "override": !request.gate_passed,
                "outstanding_approvers": outstanding,
            }));

        Ok(TransitionOutcome { item, event })
    }

    /// Terminal rejection. Refused once a posting attempt is in flight and
    /// no outcome has been recorded.
    pub fn reject(
        &self,
        mut item: ApItem,
        reason: &str,
        ctx: &ActionContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        if item.state == ApState::Posting {
            return Err(TransitionError::ConflictPostStarted);
        }
        if !item.state.is_reject_eligible() {
            return Err(TransitionError::InvalidState { state: item.state, action: "reject" });
        }

        let from = item.state;
        item.state = ApState::Rejected;
        item.updated_at = Utc::now();

        let event = self
            .event(&item, event_types::REJECTED, ctx)
            .with_states(Some(from), Some(ApState::Rejected))
            .with_payload(json!({ "reason": reason }));

        Ok(TransitionOutcome { item, event })
    }

    /// Claim the item for posting. Verifies `ready_to_post` and an empty
    /// ERP reference, moves to the in-flight state and stamps
    /// `post_attempted_at` on the first attempt only. No audit event here;
    /// the posting outcome event carries the attempt timestamp.
    pub fn begin_post(
        &self,
        mut item: ApItem,
        now: DateTime<Utc>,
    ) -> Result<ApItem, TransitionError> {
        if let Some(erp_reference) = &item.erp_reference {
            return Err(TransitionError::AlreadyPosted { erp_reference: erp_reference.clone() });
        }
        if item.state != ApState::ReadyToPost {
            return Err(TransitionError::InvalidState { state: item.state, action: "attempt_post" });
        }

        item.state = ApState::Posting;
        if item.post_attempted_at.is_none() {
            item.post_attempted_at = Some(now);
        }
        item.updated_at = now;
        Ok(item)
    }

    /// Confirmed posting: store the ERP reference and close the item.
    pub fn record_post_success(
        &self,
        mut item: ApItem,
        erp_reference: impl Into<String>,
        ctx: &ActionContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        if item.state != ApState::Posting {
            return Err(TransitionError::InvalidState { state: item.state, action: "record_post" });
        }

        let erp_reference = erp_reference.into();
        item.erp_reference = Some(erp_reference.clone());
        item.state = ApState::Closed;
        item.updated_at = Utc::now();

        let event = self
            .event(&item, event_types::POSTED, ctx)
            .with_states(Some(ApState::ReadyToPost), Some(ApState::Closed))
            .with_payload(json!({
                "erp_reference": erp_reference,
                "post_attempted_at": item.post_attempted_at,
            }))
            .with_external_refs(json!({ "erp_reference": erp_reference }));

        Ok(TransitionOutcome { item, event })
    }

    /// Failed or unknown-outcome posting attempt. `post_attempted_at` stays
    /// set; the explicit retry endpoint re-queues the item.
    pub fn record_post_failure(
        &self,
        mut item: ApItem,
        error: &str,
        ctx: &ActionContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        if item.state != ApState::Posting {
            return Err(TransitionError::InvalidState { state: item.state, action: "record_post" });
        }

        item.state = ApState::FailedPost;
        item.updated_at = Utc::now();

        let event = self
            .event(&item, event_types::POST_FAILED, ctx)
            .with_states(Some(ApState::ReadyToPost), Some(ApState::FailedPost))
            .with_payload(json!({
                "error": error,
                "post_attempted_at": item.post_attempted_at,
            }));

        Ok(TransitionOutcome { item, event })
    }

    /// Explicit retry after a failed posting attempt. Guarded on the ERP
    /// reference so a late success can never be posted twice.
    pub fn retry_post(
        &self,
        mut item: ApItem,
        ctx: &ActionContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        if let Some(erp_reference) = &item.erp_reference {
            return Err(TransitionError::AlreadyPosted { erp_reference: erp_reference.clone() });
        }
        if item.state != ApState::FailedPost {
            return Err(TransitionError::InvalidState { state: item.state, action: "retry_post" });
        }

        item.state = ApState::ReadyToPost;
        item.updated_at = Utc::now();

        let event = self
            .event(&item, event_types::POST_RETRY, ctx)
            .with_states(Some(ApState::FailedPost), Some(ApState::ReadyToPost));

        Ok(TransitionOutcome { item, event })
    }

    fn event(&self, item: &ApItem, event_type: &str, ctx: &ActionContext) -> AuditEvent {
        AuditEvent::new(
            item.id.clone(),
            item.organization_id.clone(),
            event_type,
            ctx.actor_type,
            ctx.actor_id.clone(),
            ctx.idempotency_key.clone(),
        )
    }
}
