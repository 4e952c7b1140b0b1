//! Workflow service: the write path for AP items. Every mutation follows the
//! same shape: replay check against the ledger, pure transition in the
//! engine, conditional store update, ledger append. The conditional update
//! is what keeps concurrent callers from both winning.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use apflow_core::audit::AuditEvent;
use apflow_core::correlation;
use apflow_core::domain::item::{ApItem, ApItemId, ApState, ItemMetadata, OrganizationId};
use apflow_core::domain::policy::{PolicyConfig, PolicyDocument, DEFAULT_POLICY_NAME};
use apflow_core::domain::validation::{BudgetImpactEntry, PoMatchException};
use apflow_core::errors::{ApplicationError, DomainError};
use apflow_core::gate::{self, GateDecision, GateInput};
use apflow_core::lifecycle::{
    event_types, ActionContext, ApprovalRequest, TransitionEngine, TransitionError,
    TransitionOutcome,
};
use apflow_core::policy::{self, EvaluationInput};
use apflow_core::router::{self, ApprovalChannel};
use apflow_core::EffectivePolicy;
use apflow_db::{
    AuditLedger, ItemRepository, PolicyRepository, RepositoryError, SourceRepository,
};

use crate::erp::ErpPoster;
use crate::notify::Notifier;

pub(crate) fn storage(error: RepositoryError) -> ApplicationError {
    ApplicationError::Persistence(error.to_string())
}

fn domain(error: TransitionError) -> ApplicationError {
    ApplicationError::Domain(DomainError::Transition(error))
}

/// Collaborator facts folded into one gate evaluation. Intake runs with the
/// defaults; the validate endpoint lets callers supply richer context.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ValidationContext {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub has_purchase_order: bool,
    #[serde(default)]
    pub is_new_vendor: bool,
    #[serde(default)]
    pub po_exceptions: Vec<PoMatchException>,
    #[serde(default)]
    pub budget_impact: Vec<BudgetImpactEntry>,
}

#[derive(Clone, Debug)]
pub struct ValidationOutcome {
    pub item: ApItem,
    /// Absent on an idempotent replay; the original decision is already in
    /// the ledger.
    pub decision: Option<GateDecision>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SplitRequest {
    pub amount: Decimal,
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub source_ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorklistEntry {
    pub item: ApItem,
    pub source_count: i64,
    pub sla_breached: bool,
    pub due_soon: bool,
}

pub struct WorkflowService {
    items: Arc<dyn ItemRepository>,
    sources: Arc<dyn SourceRepository>,
    ledger: Arc<dyn AuditLedger>,
    policies: Arc<dyn PolicyRepository>,
    erp: Arc<dyn ErpPoster>,
    notifier: Arc<dyn Notifier>,
    engine: TransitionEngine,
    default_auto_approval_threshold: f64,
    approval_sla_minutes: i64,
}

impl WorkflowService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        items: Arc<dyn ItemRepository>,
        sources: Arc<dyn SourceRepository>,
        ledger: Arc<dyn AuditLedger>,
        policies: Arc<dyn PolicyRepository>,
        erp: Arc<dyn ErpPoster>,
        notifier: Arc<dyn Notifier>,
        default_auto_approval_threshold: f64,
        approval_sla_minutes: i64,
    ) -> Self {
        Self {
            items,
            sources,
            ledger,
            policies,
            erp,
            notifier,
            engine: TransitionEngine::new(),
            default_auto_approval_threshold,
            approval_sla_minutes,
        }
    }

    pub async fn load(&self, id: &ApItemId) -> Result<ApItem, ApplicationError> {
        self.items
            .find_by_id(id)
            .await
            .map_err(storage)?
            .ok_or_else(|| ApplicationError::Domain(DomainError::ItemNotFound(id.0.clone())))
    }

    pub async fn audit_events(&self, id: &ApItemId) -> Result<Vec<AuditEvent>, ApplicationError> {
        // A missing item yields 404 rather than an empty trail.
        self.load(id).await?;
        self.ledger.list_for_item(id).await.map_err(storage)
    }

    pub async fn organization_events(
        &self,
        organization_id: &OrganizationId,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, ApplicationError> {
        self.ledger.list_for_organization(organization_id, limit).await.map_err(storage)
    }

    /// Run the validation gate and route the item. Intake calls this right
    /// after item creation; the HTTP endpoint re-runs it after a human
    /// supplies missing information.
    pub async fn validate(
        &self,
        id: &ApItemId,
        context: ValidationContext,
        ctx: ActionContext,
    ) -> Result<ValidationOutcome, ApplicationError> {
        if self.replayed(&ctx).await? {
            return Ok(ValidationOutcome { item: self.load(id).await?, decision: None });
        }

        let item = self.load(id).await?;
        let decision = self.gate_decision(&item, &context).await?;
        let outcome = self
            .apply(id, |mut item| {
                stamp_derived_facts(&mut item, &decision, &context);
                self.engine.validate(item, &decision, &ctx)
            })
            .await?;

        let route = router::route(&decision);
        if route.channel == ApprovalChannel::Approval {
            self.notifier.notify_approval_needed(&outcome.item, &route).await;
        }

        let mut item = outcome.item;
        if decision.passed {
            let ready_ctx =
                ActionContext::system(format!("{}:ready", ctx.idempotency_key));
            item = self
                .apply(id, |item| self.engine.mark_ready(item, &ready_ctx))
                .await?
                .item;
        }

        tracing::info!(
            event_name = "workflow.validated",
            correlation_id = %ctx.idempotency_key,
            ap_item_id = %id.0,
            passed = decision.passed,
            state = item.state.as_str(),
            "validation gate evaluated"
        );
        Ok(ValidationOutcome { item, decision: Some(decision) })
    }

    /// Record one approver's confirmation. Approving an item that did not
    /// pass the gate is a human override and demands a justification.
    pub async fn approve(
        &self,
        id: &ApItemId,
        justification: Option<String>,
        ctx: ActionContext,
    ) -> Result<ApItem, ApplicationError> {
        if self.replayed(&ctx).await? {
            return self.load(id).await;
        }

        let item = self.load(id).await?;
        let request = ApprovalRequest {
            actor_id: ctx.actor_id.clone(),
            justification,
            gate_passed: !item.approval_required,
            required_approvers: item.metadata.required_approvers.clone(),
        };

        let outcome =
            self.apply(id, |item| self.engine.approve(item, &request, &ctx)).await?;
        tracing::info!(
            event_name = "workflow.approved",
            correlation_id = %ctx.idempotency_key,
            ap_item_id = %id.0,
            actor_id = %ctx.actor_id,
            state = outcome.item.state.as_str(),
            "approval recorded"
        );
        Ok(outcome.item)
    }

    pub async fn reject(
        &self,
        id: &ApItemId,
        reason: &str,
        ctx: ActionContext,
    ) -> Result<ApItem, ApplicationError> {
        if self.replayed(&ctx).await? {
            return self.load(id).await;
        }

        let outcome = self.apply(id, |item| self.engine.reject(item, reason, &ctx)).await?;
        tracing::info!(
            event_name = "workflow.rejected",
            correlation_id = %ctx.idempotency_key,
            ap_item_id = %id.0,
            reason,
            "item rejected"
        );
        Ok(outcome.item)
    }

    /// Post the item to the ERP. The claim into the in-flight state is a
    /// conditional update out of `ready_to_post`, so two racing callers can
    /// never both reach the external call. A replay of an already-recorded
    /// key never talks to the ERP at all.
    pub async fn attempt_post(
        &self,
        id: &ApItemId,
        ctx: ActionContext,
    ) -> Result<ApItem, ApplicationError> {
        if self.replayed(&ctx).await? {
            tracing::info!(
                event_name = "workflow.post.replayed",
                correlation_id = %ctx.idempotency_key,
                ap_item_id = %id.0,
                "posting replay short-circuited"
            );
            return self.load(id).await;
        }

        let claimed = self.claim_for_posting(id).await?;

        match self.erp.post_invoice(&claimed).await {
            Ok(erp_reference) => {
                let outcome = self
                    .engine
                    .record_post_success(claimed, erp_reference, &ctx)
                    .map_err(domain)?;
                let item = self.finish_posting(outcome).await?;
                tracing::info!(
                    event_name = "workflow.posted",
                    correlation_id = %ctx.idempotency_key,
                    ap_item_id = %id.0,
                    erp_reference = item.erp_reference.as_deref().unwrap_or(""),
                    "invoice posted"
                );
                Ok(item)
            }
            Err(error) => {
                // Unknown outcomes (timeouts) land here too; the item parks
                // in failed_post until an explicit retry.
                let failure_ctx = ActionContext::new(
                    ctx.actor_type,
                    ctx.actor_id.clone(),
                    format!("{}:failed", ctx.idempotency_key),
                );
                let outcome = self
                    .engine
                    .record_post_failure(claimed, &error.to_string(), &failure_ctx)
                    .map_err(domain)?;
                self.finish_posting(outcome).await?;
                tracing::warn!(
                    event_name = "workflow.post_failed",
                    correlation_id = %ctx.idempotency_key,
                    ap_item_id = %id.0,
                    error = %error,
                    "posting attempt failed"
                );
                Err(ApplicationError::Integration(error.to_string()))
            }
        }
    }

    pub async fn retry_post(
        &self,
        id: &ApItemId,
        ctx: ActionContext,
    ) -> Result<ApItem, ApplicationError> {
        if self.replayed(&ctx).await? {
            return self.load(id).await;
        }

        let outcome = self.apply(id, |item| self.engine.retry_post(item, &ctx)).await?;
        Ok(outcome.item)
    }

    /// Merge two items a human judged to be the same invoice. The losing
    /// item is closed with a pointer to the survivor and its sources move
    /// over atomically.
    pub async fn merge(
        &self,
        target_id: &ApItemId,
        source_id: &ApItemId,
        ctx: ActionContext,
    ) -> Result<ApItem, ApplicationError> {
        if self.replayed(&ctx).await? {
            return self.load(target_id).await;
        }

        let target = self.load(target_id).await?;
        let source = self.load(source_id).await?;

        if target.id == source.id {
            return Err(invariant("an item cannot be merged into itself"));
        }
        if target.organization_id != source.organization_id {
            return Err(invariant("merge requires both items in the same organization"));
        }
        if !target.is_open() {
            return Err(invariant("merge target is no longer open"));
        }
        if !source.state.is_reject_eligible() {
            return Err(invariant(
                "items in or past the posting queue cannot be merged away",
            ));
        }

        let mut closed = source.clone();
        closed.state = ApState::Closed;
        closed.metadata.merged_into_ap_item_id = Some(target.id.clone());
        closed.metadata.hidden_from_worklist = true;
        closed.updated_at = Utc::now();

        self.items.merge_items(&target.id, &closed).await.map_err(storage)?;

        let event = AuditEvent::new(
            target.id.clone(),
            target.organization_id.clone(),
            event_types::ITEMS_MERGED,
            ctx.actor_type,
            ctx.actor_id.clone(),
            ctx.idempotency_key.clone(),
        )
        .with_payload(json!({
            "merged_item_id": source.id.0,
            "merged_amount": source.amount.to_string(),
        }));
        self.ledger.append(event).await.map_err(storage)?;

        tracing::info!(
            event_name = "workflow.items_merged",
            correlation_id = %ctx.idempotency_key,
            ap_item_id = %target.id.0,
            merged_item_id = %source.id.0,
            "duplicate item merged"
        );
        self.load(target_id).await
    }

    /// Carve named sources out of an over-merged item into a fresh one. The
    /// new item starts at `received` and goes through validation on its own.
    pub async fn split(
        &self,
        id: &ApItemId,
        request: SplitRequest,
        ctx: ActionContext,
    ) -> Result<ApItem, ApplicationError> {
        if let Some(original) =
            self.ledger.find_by_idempotency_key(&ctx.idempotency_key).await.map_err(storage)?
        {
            let new_id = original
                .payload
                .get("new_item_id")
                .and_then(|value| value.as_str())
                .map(str::to_string);
            if let Some(new_id) = new_id {
                return self.load(&ApItemId(new_id)).await;
            }
            return self.load(id).await;
        }

        let original = self.load(id).await?;
        if !original.is_open() {
            return Err(invariant("only open items can be split"));
        }
        if request.amount <= Decimal::ZERO {
            return Err(invariant("split amount must be positive"));
        }

        let now = Utc::now();
        let new_item = ApItem {
            id: ApItemId::generate(),
            organization_id: original.organization_id.clone(),
            invoice_key: correlation::invoice_key(
                &original.vendor_name,
                request.invoice_number.as_deref(),
                request.amount,
                None,
            ),
            vendor_name: original.vendor_name.clone(),
            amount: request.amount,
            currency: original.currency.clone(),
            invoice_number: request.invoice_number.clone(),
            due_date: None,
            confidence: original.confidence,
            state: ApState::Received,
            approval_required: false,
            post_attempted_at: None,
            erp_reference: None,
            metadata: ItemMetadata::default(),
            created_at: now,
            updated_at: now,
        };

        let moved: Vec<apflow_core::SourceId> =
            request.source_ids.iter().cloned().map(apflow_core::SourceId).collect();
        self.items.split_item(&new_item, &moved).await.map_err(storage)?;

        let split_event = AuditEvent::new(
            original.id.clone(),
            original.organization_id.clone(),
            event_types::ITEM_SPLIT,
            ctx.actor_type,
            ctx.actor_id.clone(),
            ctx.idempotency_key.clone(),
        )
        .with_payload(json!({
            "new_item_id": new_item.id.0,
            "amount": request.amount.to_string(),
            "moved_sources": request.source_ids,
        }));
        self.ledger.append(split_event).await.map_err(storage)?;

        let new_side_event = AuditEvent::new(
            new_item.id.clone(),
            new_item.organization_id.clone(),
            event_types::ITEM_SPLIT,
            ctx.actor_type,
            ctx.actor_id.clone(),
            format!("{}:new", ctx.idempotency_key),
        )
        .with_states(None, Some(ApState::Received))
        .with_payload(json!({ "split_from": original.id.0 }));
        self.ledger.append(new_side_event).await.map_err(storage)?;

        tracing::info!(
            event_name = "workflow.item_split",
            correlation_id = %ctx.idempotency_key,
            ap_item_id = %original.id.0,
            new_item_id = %new_item.id.0,
            "item split"
        );
        Ok(new_item)
    }

    /// Record a rejected approval callback so tampering attempts leave a
    /// trail. Key derives from the callback token, so redelivery of the same
    /// forged request stays a single row.
    pub async fn record_callback_rejection(
        &self,
        id: &ApItemId,
        token: &str,
        detail: &str,
    ) -> Result<(), ApplicationError> {
        let Some(item) = self.items.find_by_id(id).await.map_err(storage)? else {
            return Ok(());
        };

        let event = AuditEvent::new(
            item.id.clone(),
            item.organization_id.clone(),
            event_types::APPROVAL_CALLBACK_REJECTED,
            apflow_core::ActorType::Webhook,
            "approval-callback",
            format!("approval_callback_rejected:{token}"),
        )
        .with_payload(json!({ "detail": detail }));
        self.ledger.append(event).await.map_err(storage)?;
        Ok(())
    }

    /// Compliance append for external collaborators: facts about an item
    /// that did not move state. Returns the stored event and whether this
    /// call wrote it; redelivery of the same key returns the original row.
    pub async fn record_external_event(
        &self,
        id: &ApItemId,
        event_type: &str,
        actor_type: apflow_core::ActorType,
        actor_id: &str,
        idempotency_key: &str,
        payload: serde_json::Value,
    ) -> Result<(AuditEvent, bool), ApplicationError> {
        let item = self.load(id).await?;
        let mut event = AuditEvent::new(
            item.id,
            item.organization_id,
            event_type,
            actor_type,
            actor_id,
            idempotency_key,
        );
        if !payload.is_null() {
            event = event.with_payload(payload);
        }
        let outcome = self.ledger.append(event).await.map_err(storage)?;
        let fresh = outcome.is_fresh();
        Ok((outcome.event().clone(), fresh))
    }

    /// Open items decorated for the review queue. Merged-away items are
    /// hidden; conflict flags and SLA hints ride along.
    pub async fn worklist(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<WorklistEntry>, ApplicationError> {
        let now = Utc::now();
        let sla = Duration::minutes(self.approval_sla_minutes);
        let due_window = Duration::days(7);

        let open = self.items.list_open(organization_id).await.map_err(storage)?;
        let mut entries = Vec::with_capacity(open.len());
        for item in open {
            if item.metadata.hidden_from_worklist {
                continue;
            }
            let source_count = self.sources.count_for_item(&item.id).await.map_err(storage)?;
            let sla_breached =
                item.state == ApState::NeedsApproval && now - item.updated_at > sla;
            let due_soon = item
                .due_date
                .is_some_and(|due| due - now.date_naive() <= due_window);
            entries.push(WorklistEntry { item, source_count, sla_breached, due_soon });
        }
        Ok(entries)
    }

    pub async fn effective_policy(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
    ) -> Result<EffectivePolicy, ApplicationError> {
        self.policies.effective(organization_id, policy_name).await.map_err(storage)
    }

    pub async fn policy_versions(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
    ) -> Result<Vec<PolicyDocument>, ApplicationError> {
        self.policies.list_versions(organization_id, policy_name).await.map_err(storage)
    }

    pub async fn put_policy(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
        config: PolicyConfig,
        updated_by: &str,
        enabled: bool,
    ) -> Result<PolicyDocument, ApplicationError> {
        let document = self
            .policies
            .put_version(organization_id, policy_name, config, updated_by, enabled)
            .await
            .map_err(storage)?;
        tracing::info!(
            event_name = "workflow.policy_updated",
            organization_id = %organization_id.0,
            policy_name,
            version = document.version,
            enabled,
            "policy version stored"
        );
        Ok(document)
    }

    pub(crate) fn engine(&self) -> &TransitionEngine {
        &self.engine
    }

    async fn replayed(&self, ctx: &ActionContext) -> Result<bool, ApplicationError> {
        Ok(self
            .ledger
            .find_by_idempotency_key(&ctx.idempotency_key)
            .await
            .map_err(storage)?
            .is_some())
    }

    async fn gate_decision(
        &self,
        item: &ApItem,
        context: &ValidationContext,
    ) -> Result<GateDecision, ApplicationError> {
        let effective = self
            .policies
            .effective(&item.organization_id, DEFAULT_POLICY_NAME)
            .await
            .map_err(storage)?;
        let document = effective.document();

        let evaluation = policy::evaluate(
            document,
            &EvaluationInput {
                vendor_name: item.vendor_name.clone(),
                amount: item.amount,
                currency: item.currency.clone(),
                category: context.category.clone(),
                has_purchase_order: context.has_purchase_order,
                is_new_vendor: context.is_new_vendor,
                budget_impact: context.budget_impact.clone(),
            },
        );

        let missing = missing_fields(item);
        let threshold = if effective.is_configured() {
            document.config.auto_approval_threshold
        } else {
            self.default_auto_approval_threshold
        };

        Ok(gate::evaluate(GateInput {
            policy: &evaluation,
            po_exceptions: &context.po_exceptions,
            budget_impact: &context.budget_impact,
            missing_fields: &missing,
            confidence: item.confidence,
            auto_approval_threshold: threshold,
            block_on_budget_overrun: document.config.block_on_budget_overrun,
        }))
    }

    /// Load-compute-conditionally-store, retried once so a lost race
    /// surfaces the domain error for the fresh state instead of a blind
    /// storage failure.
    async fn apply<F>(
        &self,
        id: &ApItemId,
        transition: F,
    ) -> Result<TransitionOutcome, ApplicationError>
    where
        F: Fn(ApItem) -> Result<TransitionOutcome, TransitionError>,
    {
        for _ in 0..2 {
            let item = self.load(id).await?;
            let expected = item.state;
            let outcome = transition(item).map_err(domain)?;
            if self.items.update_if_state(&outcome.item, expected).await.map_err(storage)? {
                self.ledger.append(outcome.event.clone()).await.map_err(storage)?;
                return Ok(outcome);
            }
        }
        Err(ApplicationError::Persistence(format!("item {} changed concurrently", id.0)))
    }

    async fn claim_for_posting(&self, id: &ApItemId) -> Result<ApItem, ApplicationError> {
        for _ in 0..2 {
            let item = self.load(id).await?;
            let claimed = self.engine.begin_post(item, Utc::now()).map_err(domain)?;
            if self
                .items
                .update_if_state(&claimed, ApState::ReadyToPost)
                .await
                .map_err(storage)?
            {
                return Ok(claimed);
            }
        }
        Err(ApplicationError::Persistence(format!("item {} changed concurrently", id.0)))
    }

    /// Record a posting outcome. Only the claim holder ever sees the item in
    /// the in-flight state, so this update not matching means the store and
    /// the process disagree about who holds the claim.
    async fn finish_posting(
        &self,
        outcome: TransitionOutcome,
    ) -> Result<ApItem, ApplicationError> {
        let updated = self
            .items
            .update_if_state(&outcome.item, ApState::Posting)
            .await
            .map_err(storage)?;
        if !updated {
            return Err(ApplicationError::Persistence(format!(
                "posting claim on item {} was lost",
                outcome.item.id.0
            )));
        }
        self.ledger.append(outcome.event).await.map_err(storage)?;
        Ok(outcome.item)
    }
}

fn invariant(message: &str) -> ApplicationError {
    ApplicationError::Domain(DomainError::InvariantViolation(message.to_string()))
}

fn missing_fields(item: &ApItem) -> Vec<String> {
    let mut missing = Vec::new();
    if item.vendor_name.trim().is_empty() {
        missing.push("vendor_name".to_string());
    }
    if item.invoice_number.as_deref().map(str::trim).filter(|v| !v.is_empty()).is_none() {
        missing.push("invoice_number".to_string());
    }
    if item.amount <= Decimal::ZERO {
        missing.push("amount".to_string());
    }
    missing
}

/// Derived facts the worklist surfaces. Written as part of the validate
/// transition, so they land in the same conditional update as the state.
fn stamp_derived_facts(item: &mut ApItem, decision: &GateDecision, context: &ValidationContext) {
    item.metadata.priority_score = Some(priority_score(item, Utc::now()));
    if let Some(exception) = context.po_exceptions.first() {
        item.metadata.exception_code = Some(exception.code.clone());
        item.metadata.exception_severity =
            Some(if decision.passed { "warning" } else { "critical" }.to_string());
    }
    if !context.budget_impact.is_empty() {
        item.metadata.budget_snapshot = serde_json::to_value(&context.budget_impact).ok();
    }
}

/// Worklist ordering hint. Larger amounts, nearer due dates, shaky
/// extractions and flagged conflicts all raise the score.
fn priority_score(item: &ApItem, now: chrono::DateTime<Utc>) -> i64 {
    let mut score: i64 = 0;
    if item.amount >= Decimal::new(10_000, 0) {
        score += 40;
    } else if item.amount >= Decimal::new(1_000, 0) {
        score += 20;
    }
    if let Some(due) = item.due_date {
        let days_left = (due - now.date_naive()).num_days();
        if days_left <= 2 {
            score += 40;
        } else if days_left <= 7 {
            score += 25;
        }
    }
    if item.confidence < 0.7 {
        score += 10;
    }
    if item.metadata.has_context_conflict {
        score += 15;
    }
    score
}
