use std::collections::HashMap;

use tokio::sync::RwLock;

use apflow_core::audit::AuditEvent;
use apflow_core::domain::item::{ApItem, ApItemId, ApState, ItemMetadata, OrganizationId};
use apflow_core::domain::policy::{EffectivePolicy, PolicyConfig, PolicyDocument};
use apflow_core::domain::source::{Source, SourceId};

use super::{
    AppendOutcome, AuditLedger, ItemRepository, PolicyRepository, RepositoryError,
    SourceRepository,
};

#[derive(Default)]
pub struct InMemoryItemRepository {
    items: RwLock<HashMap<String, ApItem>>,
}

#[async_trait::async_trait]
impl ItemRepository for InMemoryItemRepository {
    async fn find_by_id(&self, id: &ApItemId) -> Result<Option<ApItem>, RepositoryError> {
        let items = self.items.read().await;
        Ok(items.get(&id.0).cloned())
    }

    async fn insert(&self, item: &ApItem) -> Result<(), RepositoryError> {
        let mut items = self.items.write().await;
        items.insert(item.id.0.clone(), item.clone());
        Ok(())
    }

    async fn set_metadata_if_state(
        &self,
        id: &ApItemId,
        metadata: &ItemMetadata,
        expected: ApState,
    ) -> Result<bool, RepositoryError> {
        let mut items = self.items.write().await;
        match items.get_mut(&id.0) {
            Some(current) if current.state == expected => {
                current.metadata = metadata.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_if_state(
        &self,
        item: &ApItem,
        expected: ApState,
    ) -> Result<bool, RepositoryError> {
        let mut items = self.items.write().await;
        match items.get(&item.id.0) {
            Some(current) if current.state == expected => {
                items.insert(item.id.0.clone(), item.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_open_by_vendor_invoice(
        &self,
        organization_id: &OrganizationId,
        vendor_name: &str,
        invoice_number: &str,
    ) -> Result<Vec<ApItem>, RepositoryError> {
        let items = self.items.read().await;
        Ok(items
            .values()
            .filter(|item| {
                item.organization_id == *organization_id
                    && item.is_open()
                    && item.vendor_name.trim().eq_ignore_ascii_case(vendor_name.trim())
                    && item
                        .invoice_number
                        .as_deref()
                        .is_some_and(|existing| {
                            existing.trim().eq_ignore_ascii_case(invoice_number.trim())
                        })
            })
            .cloned()
            .collect())
    }

    async fn list_open(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<ApItem>, RepositoryError> {
        let items = self.items.read().await;
        let mut open: Vec<ApItem> = items
            .values()
            .filter(|item| item.organization_id == *organization_id && item.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|item| item.created_at);
        Ok(open)
    }

    async fn list_by_state(&self, state: ApState) -> Result<Vec<ApItem>, RepositoryError> {
        let items = self.items.read().await;
        let mut matched: Vec<ApItem> =
            items.values().filter(|item| item.state == state).cloned().collect();
        matched.sort_by_key(|item| item.updated_at);
        Ok(matched)
    }

    async fn merge_items(
        &self,
        _target_id: &ApItemId,
        closed_source: &ApItem,
    ) -> Result<(), RepositoryError> {
        // Source reassignment lives in the source fake; only the closed
        // item row is written here.
        self.insert(closed_source).await
    }

    async fn split_item(
        &self,
        new_item: &ApItem,
        _moved_sources: &[SourceId],
    ) -> Result<(), RepositoryError> {
        self.insert(new_item).await
    }
}

#[derive(Default)]
pub struct InMemorySourceRepository {
    sources: RwLock<Vec<Source>>,
    attachments: RwLock<HashMap<String, Vec<String>>>,
}

#[async_trait::async_trait]
impl SourceRepository for InMemorySourceRepository {
    async fn link(&self, source: &Source) -> Result<bool, RepositoryError> {
        let mut sources = self.sources.write().await;
        let already_linked = sources.iter().any(|existing| {
            existing.ap_item_id == source.ap_item_id
                && existing.source_type == source.source_type
                && existing.source_ref == source.source_ref
        });
        if already_linked {
            return Ok(false);
        }
        sources.push(source.clone());
        Ok(true)
    }

    async fn list_for_item(&self, id: &ApItemId) -> Result<Vec<Source>, RepositoryError> {
        let sources = self.sources.read().await;
        Ok(sources.iter().filter(|source| source.ap_item_id == *id).cloned().collect())
    }

    async fn count_for_item(&self, id: &ApItemId) -> Result<i64, RepositoryError> {
        Ok(self.list_for_item(id).await?.len() as i64)
    }

    async fn record_attachment_hashes(
        &self,
        id: &ApItemId,
        hashes: &[String],
    ) -> Result<(), RepositoryError> {
        let mut attachments = self.attachments.write().await;
        let entry = attachments.entry(id.0.clone()).or_default();
        for hash in hashes {
            if !entry.contains(hash) {
                entry.push(hash.clone());
            }
        }
        Ok(())
    }

    async fn attachment_hashes_for_item(
        &self,
        id: &ApItemId,
    ) -> Result<Vec<String>, RepositoryError> {
        let attachments = self.attachments.read().await;
        Ok(attachments.get(&id.0).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryAuditLedger {
    events: RwLock<Vec<AuditEvent>>,
}

#[async_trait::async_trait]
impl AuditLedger for InMemoryAuditLedger {
    async fn append(&self, event: AuditEvent) -> Result<AppendOutcome, RepositoryError> {
        let mut events = self.events.write().await;
        if let Some(existing) =
            events.iter().find(|existing| existing.idempotency_key == event.idempotency_key)
        {
            return Ok(AppendOutcome::Duplicate(existing.clone()));
        }
        events.push(event.clone());
        Ok(AppendOutcome::Appended(event))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<AuditEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events.iter().find(|event| event.idempotency_key == key).cloned())
    }

    async fn list_for_item(&self, id: &ApItemId) -> Result<Vec<AuditEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|event| event.ap_item_id == *id).cloned().collect())
    }

    async fn list_for_organization(
        &self,
        organization_id: &OrganizationId,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|event| event.organization_id == *organization_id)
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryPolicyRepository {
    documents: RwLock<Vec<PolicyDocument>>,
}

#[async_trait::async_trait]
impl PolicyRepository for InMemoryPolicyRepository {
    async fn effective(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
    ) -> Result<EffectivePolicy, RepositoryError> {
        let documents = self.documents.read().await;
        let latest = documents
            .iter()
            .filter(|doc| {
                doc.organization_id == *organization_id
                    && doc.policy_name == policy_name
                    && doc.enabled
            })
            .max_by_key(|doc| doc.version);

        Ok(match latest {
            Some(doc) => EffectivePolicy::Configured(doc.clone()),
            None => EffectivePolicy::BuiltInDefault(PolicyDocument::built_in_default(
                organization_id.clone(),
                policy_name,
            )),
        })
    }

    async fn put_version(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
        config: PolicyConfig,
        updated_by: &str,
        enabled: bool,
    ) -> Result<PolicyDocument, RepositoryError> {
        let mut documents = self.documents.write().await;
        let version = documents
            .iter()
            .filter(|doc| doc.organization_id == *organization_id && doc.policy_name == policy_name)
            .map(|doc| doc.version)
            .max()
            .unwrap_or(0)
            + 1;

        let document = PolicyDocument {
            organization_id: organization_id.clone(),
            policy_name: policy_name.to_string(),
            version,
            config,
            enabled,
            updated_by: updated_by.to_string(),
            created_at: chrono::Utc::now(),
        };
        documents.push(document.clone());
        Ok(document)
    }

    async fn list_versions(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
    ) -> Result<Vec<PolicyDocument>, RepositoryError> {
        let documents = self.documents.read().await;
        let mut versions: Vec<PolicyDocument> = documents
            .iter()
            .filter(|doc| doc.organization_id == *organization_id && doc.policy_name == policy_name)
            .cloned()
            .collect();
        versions.sort_by_key(|doc| std::cmp::Reverse(doc.version));
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use apflow_core::audit::{ActorType, AuditEvent};
    use apflow_core::domain::item::{
        ApItem, ApItemId, ApState, ItemMetadata, OrganizationId,
    };

    use crate::repositories::{
        AuditLedger, InMemoryAuditLedger, InMemoryItemRepository, ItemRepository,
    };

    fn item(id: &str, state: ApState) -> ApItem {
        let now = Utc::now();
        ApItem {
            id: ApItemId(id.to_string()),
            organization_id: OrganizationId("org-1".to_string()),
            invoice_key: String::new(),
            vendor_name: "Initech Supplies".to_string(),
            amount: Decimal::new(100_00, 2),
            currency: "USD".to_string(),
            invoice_number: Some("INV-1".to_string()),
            due_date: None,
            confidence: 0.9,
            state,
            approval_required: false,
            post_attempted_at: None,
            erp_reference: None,
            metadata: ItemMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn in_memory_cas_matches_sql_semantics() {
        let repo = InMemoryItemRepository::default();
        repo.insert(&item("item-1", ApState::ReadyToPost)).await.expect("insert");

        let mut claimed = item("item-1", ApState::Posting);
        claimed.post_attempted_at = Some(Utc::now());

        assert!(repo.update_if_state(&claimed, ApState::ReadyToPost).await.expect("first"));
        assert!(!repo.update_if_state(&claimed, ApState::ReadyToPost).await.expect("second"));
    }

    #[tokio::test]
    async fn in_memory_ledger_dedups_on_idempotency_key() {
        let ledger = InMemoryAuditLedger::default();
        let event = AuditEvent::new(
            ApItemId("item-1".to_string()),
            OrganizationId("org-1".to_string()),
            "approved",
            ActorType::Webhook,
            "user-7",
            "approve:item-1:user-7",
        );

        assert!(ledger.append(event.clone()).await.expect("first").is_fresh());
        assert!(!ledger.append(event).await.expect("replay").is_fresh());
    }
}
