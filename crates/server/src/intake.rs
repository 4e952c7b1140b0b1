//! Detection intake: correlates each normalized detection against the
//! organization's open items before anything is written. Duplicates attach
//! to the existing item, conflicts become flagged items awaiting human
//! disambiguation, everything else becomes a fresh item that goes straight
//! through the validation gate.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;

use apflow_core::audit::{ActorType, AuditEvent};
use apflow_core::correlation::{
    self, CorrelationConfig, CorrelationDecision, Detection, MergeReason, OpenItemCandidate,
};
use apflow_core::domain::item::{ApItem, ApItemId, ApState, ItemMetadata, OrganizationId};
use apflow_core::errors::ApplicationError;
use apflow_core::gate::GateDecision;
use apflow_core::lifecycle::{event_types, ActionContext};
use apflow_db::{AuditLedger, ItemRepository, SourceRepository};

use crate::workflow::{storage, ValidationContext, WorkflowService};

const INTAKE_ACTOR: &str = "intake";

#[derive(Clone, Debug)]
pub enum IntakeOutcome {
    Created { item: ApItem, decision: Option<GateDecision> },
    Merged { item_id: ApItemId, reason: MergeReason, linked: bool },
    Conflict { item: ApItem, flagged_against: ApItemId },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct BatchSummary {
    pub created: usize,
    pub merged: usize,
    pub conflicts: usize,
    pub failed: usize,
}

pub struct IntakeService {
    items: Arc<dyn ItemRepository>,
    sources: Arc<dyn SourceRepository>,
    ledger: Arc<dyn AuditLedger>,
    workflow: Arc<WorkflowService>,
    correlation: CorrelationConfig,
    max_concurrency: usize,
}

impl IntakeService {
    pub fn new(
        items: Arc<dyn ItemRepository>,
        sources: Arc<dyn SourceRepository>,
        ledger: Arc<dyn AuditLedger>,
        workflow: Arc<WorkflowService>,
        correlation: CorrelationConfig,
        max_concurrency: usize,
    ) -> Self {
        Self { items, sources, ledger, workflow, correlation, max_concurrency }
    }

    pub async fn process_detection(
        &self,
        organization_id: &OrganizationId,
        detection: Detection,
    ) -> Result<IntakeOutcome, ApplicationError> {
        let candidates = self.candidates(organization_id, &detection).await?;
        let decision =
            correlation::correlate(&detection, &candidates, &self.correlation, Utc::now());

        match decision {
            CorrelationDecision::NewItem => {
                self.create_item(organization_id, detection, None).await
            }
            CorrelationDecision::Merge { existing, reason } => {
                self.merge_detection(organization_id, existing, reason, detection).await
            }
            CorrelationDecision::Conflict { flagged_against } => {
                self.create_item(organization_id, detection, Some(flagged_against)).await
            }
        }
    }

    /// Run a batch with bounded concurrency. One bad detection never sinks
    /// the batch; failures are counted and logged.
    pub async fn process_batch(
        self: &Arc<Self>,
        organization_id: &OrganizationId,
        detections: Vec<Detection>,
    ) -> BatchSummary {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(detections.len());

        for detection in detections {
            let semaphore = semaphore.clone();
            let service = self.clone();
            let organization_id = organization_id.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                service.process_detection(&organization_id, detection).await
            }));
        }

        let mut summary = BatchSummary::default();
        for handle in handles {
            match handle.await {
                Ok(Ok(IntakeOutcome::Created { .. })) => summary.created += 1,
                Ok(Ok(IntakeOutcome::Merged { .. })) => summary.merged += 1,
                Ok(Ok(IntakeOutcome::Conflict { .. })) => summary.conflicts += 1,
                Ok(Err(error)) => {
                    summary.failed += 1;
                    tracing::warn!(
                        event_name = "intake.batch.detection_failed",
                        error = %error,
                        "detection dropped from batch"
                    );
                }
                Err(join_error) => {
                    summary.failed += 1;
                    tracing::warn!(
                        event_name = "intake.batch.task_failed",
                        error = %join_error,
                        "detection task aborted"
                    );
                }
            }
        }
        summary
    }

    async fn candidates(
        &self,
        organization_id: &OrganizationId,
        detection: &Detection,
    ) -> Result<Vec<OpenItemCandidate>, ApplicationError> {
        let invoice_number =
            detection.invoice_number.as_deref().map(str::trim).filter(|v| !v.is_empty());

        let open = match invoice_number {
            Some(invoice_number) => self
                .items
                .find_open_by_vendor_invoice(
                    organization_id,
                    &detection.vendor_name,
                    invoice_number,
                )
                .await
                .map_err(storage)?,
            None if !detection.attachment_hashes.is_empty() => {
                self.items.list_open(organization_id).await.map_err(storage)?
            }
            None => Vec::new(),
        };

        let mut candidates = Vec::with_capacity(open.len());
        for item in &open {
            let hashes =
                self.sources.attachment_hashes_for_item(&item.id).await.map_err(storage)?;
            candidates.push(OpenItemCandidate::from_item(item, hashes));
        }
        Ok(candidates)
    }

    async fn create_item(
        &self,
        organization_id: &OrganizationId,
        detection: Detection,
        conflict_with: Option<ApItemId>,
    ) -> Result<IntakeOutcome, ApplicationError> {
        let now = Utc::now();
        let mut item = ApItem {
            id: ApItemId::generate(),
            organization_id: organization_id.clone(),
            invoice_key: correlation::invoice_key(
                &detection.vendor_name,
                detection.invoice_number.as_deref(),
                detection.amount,
                detection.due_date,
            ),
            vendor_name: detection.vendor_name.clone(),
            amount: detection.amount,
            currency: detection.currency.clone(),
            invoice_number: detection.invoice_number.clone(),
            due_date: detection.due_date,
            confidence: detection.confidence,
            state: ApState::Received,
            approval_required: false,
            post_attempted_at: None,
            erp_reference: None,
            metadata: ItemMetadata::default(),
            created_at: now,
            updated_at: now,
        };
        if let Some(flagged_against) = &conflict_with {
            item.metadata.has_context_conflict = true;
            item.metadata.extra.insert("conflict_with".to_string(), flagged_against.0.clone());
        }

        self.items.insert(&item).await.map_err(storage)?;

        let source = detection.source.clone().into_source(item.id.clone(), now);
        self.sources.link(&source).await.map_err(storage)?;
        self.sources
            .record_attachment_hashes(&item.id, &detection.attachment_hashes)
            .await
            .map_err(storage)?;

        let created_ctx = ActionContext::new(
            ActorType::System,
            INTAKE_ACTOR,
            format!("created:{}:{}", source.source_type.as_str(), source.source_ref),
        );
        self.ledger
            .append(self.workflow.engine().created_event(&item, &created_ctx))
            .await
            .map_err(storage)?;

        if let Some(flagged_against) = conflict_with {
            // Same invoice number, materially different amount. The item is
            // parked in `received` until a human disambiguates.
            let conflict_event = AuditEvent::new(
                item.id.clone(),
                item.organization_id.clone(),
                event_types::CONTEXT_CONFLICT,
                ActorType::System,
                INTAKE_ACTOR,
                format!("context_conflict:{}:{}", item.id.0, flagged_against.0),
            )
            .with_payload(json!({
                "flagged_against": flagged_against.0,
                "amount": item.amount.to_string(),
            }));
            self.ledger.append(conflict_event).await.map_err(storage)?;

            tracing::warn!(
                event_name = "intake.context_conflict",
                ap_item_id = %item.id.0,
                flagged_against = %flagged_against.0,
                "conflicting detection flagged for review"
            );
            return Ok(IntakeOutcome::Conflict { item, flagged_against });
        }

        let validate_ctx = ActionContext::new(
            ActorType::System,
            INTAKE_ACTOR,
            format!("validated:{}:{}", item.id.0, source.source_ref),
        );
        let validated = self
            .workflow
            .validate(&item.id, ValidationContext::default(), validate_ctx)
            .await?;

        tracing::info!(
            event_name = "intake.item_created",
            ap_item_id = %validated.item.id.0,
            organization_id = %organization_id.0,
            state = validated.item.state.as_str(),
            "detection became a new item"
        );
        Ok(IntakeOutcome::Created { item: validated.item, decision: validated.decision })
    }

    async fn merge_detection(
        &self,
        organization_id: &OrganizationId,
        existing: ApItemId,
        reason: MergeReason,
        detection: Detection,
    ) -> Result<IntakeOutcome, ApplicationError> {
        let source = detection.source.clone().into_source(existing.clone(), Utc::now());
        let linked = self.sources.link(&source).await.map_err(storage)?;
        self.sources
            .record_attachment_hashes(&existing, &detection.attachment_hashes)
            .await
            .map_err(storage)?;

        let event = AuditEvent::new(
            existing.clone(),
            organization_id.clone(),
            event_types::DETECTION_MERGED,
            ActorType::System,
            INTAKE_ACTOR,
            format!(
                "detection_merged:{}:{}:{}",
                existing.0,
                source.source_type.as_str(),
                source.source_ref
            ),
        )
        .with_payload(json!({
            "reason": reason.as_str(),
            "source_ref": source.source_ref,
            "amount": detection.amount.to_string(),
        }));
        self.ledger.append(event).await.map_err(storage)?;

        // Metadata-only conditional write. A transition committing between
        // the read and the update wins and the stamp is skipped; updated_at
        // stays put so the SLA clock does not reset when a duplicate
        // arrives.
        if let Some(item) = self.items.find_by_id(&existing).await.map_err(storage)? {
            if item.metadata.merge_reason.as_deref() != Some(reason.as_str()) {
                let mut metadata = item.metadata;
                metadata.merge_reason = Some(reason.as_str().to_string());
                self.items
                    .set_metadata_if_state(&existing, &metadata, item.state)
                    .await
                    .map_err(storage)?;
            }
        }

        tracing::info!(
            event_name = "intake.detection_merged",
            ap_item_id = %existing.0,
            reason = reason.as_str(),
            newly_linked = linked,
            "duplicate detection attached to existing item"
        );
        Ok(IntakeOutcome::Merged { item_id: existing, reason, linked })
    }
}
