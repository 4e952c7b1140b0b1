use async_trait::async_trait;
use thiserror::Error;

use apflow_core::audit::AuditEvent;
use apflow_core::domain::item::{ApItem, ApItemId, ApState, ItemMetadata, OrganizationId};
use apflow_core::domain::policy::{EffectivePolicy, PolicyConfig, PolicyDocument};
use apflow_core::domain::source::{Source, SourceId};

pub mod audit;
pub mod item;
pub mod memory;
pub mod policy;
pub mod source;

pub use audit::SqlAuditLedger;
pub use item::SqlItemRepository;
pub use memory::{
    InMemoryAuditLedger, InMemoryItemRepository, InMemoryPolicyRepository,
    InMemorySourceRepository,
};
pub use policy::SqlPolicyRepository;
pub use source::SqlSourceRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Result of appending to the audit ledger. A replayed idempotency key
/// returns the original row instead of writing a second one.
#[derive(Clone, Debug, PartialEq)]
pub enum AppendOutcome {
    Appended(AuditEvent),
    Duplicate(AuditEvent),
}

impl AppendOutcome {
    pub fn event(&self) -> &AuditEvent {
        match self {
            Self::Appended(event) | Self::Duplicate(event) => event,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Appended(_))
    }
}

#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn find_by_id(&self, id: &ApItemId) -> Result<Option<ApItem>, RepositoryError>;

    async fn insert(&self, item: &ApItem) -> Result<(), RepositoryError>;

    /// Metadata-only conditional write: replaces the metadata column while
    /// the stored state still equals `expected`. State, posting fields and
    /// `updated_at` are left untouched; returns false when a transition
    /// landed first.
    async fn set_metadata_if_state(
        &self,
        id: &ApItemId,
        metadata: &ItemMetadata,
        expected: ApState,
    ) -> Result<bool, RepositoryError>;

    /// Single-row conditional update: writes `item` only while the stored
    /// state still equals `expected`. Returns false when another caller won
    /// the race.
    async fn update_if_state(
        &self,
        item: &ApItem,
        expected: ApState,
    ) -> Result<bool, RepositoryError>;

    /// Open items of one organization that carry the given vendor and
    /// invoice number, for invoice-key correlation.
    async fn find_open_by_vendor_invoice(
        &self,
        organization_id: &OrganizationId,
        vendor_name: &str,
        invoice_number: &str,
    ) -> Result<Vec<ApItem>, RepositoryError>;

    async fn list_open(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<ApItem>, RepositoryError>;

    async fn list_by_state(&self, state: ApState) -> Result<Vec<ApItem>, RepositoryError>;

    /// Atomic manual merge: reassigns every source and attachment hash from
    /// `closed_source.id` to `target_id` and writes the closed source row.
    /// All of it commits or none of it does.
    async fn merge_items(
        &self,
        target_id: &ApItemId,
        closed_source: &ApItem,
    ) -> Result<(), RepositoryError>;

    /// Atomic manual split: inserts `new_item` and moves the named sources
    /// onto it.
    async fn split_item(
        &self,
        new_item: &ApItem,
        moved_sources: &[SourceId],
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Insert-or-ignore on `(ap_item_id, source_type, source_ref)`; returns
    /// false when the pair was already linked.
    async fn link(&self, source: &Source) -> Result<bool, RepositoryError>;

    async fn list_for_item(&self, id: &ApItemId) -> Result<Vec<Source>, RepositoryError>;

    async fn count_for_item(&self, id: &ApItemId) -> Result<i64, RepositoryError>;

    async fn record_attachment_hashes(
        &self,
        id: &ApItemId,
        hashes: &[String],
    ) -> Result<(), RepositoryError>;

    async fn attachment_hashes_for_item(
        &self,
        id: &ApItemId,
    ) -> Result<Vec<String>, RepositoryError>;
}

#[async_trait]
pub trait AuditLedger: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<AppendOutcome, RepositoryError>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<AuditEvent>, RepositoryError>;

    async fn list_for_item(&self, id: &ApItemId) -> Result<Vec<AuditEvent>, RepositoryError>;

    async fn list_for_organization(
        &self,
        organization_id: &OrganizationId,
        limit: u32,
    ) -> Result<Vec<AuditEvent>, RepositoryError>;
}

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// Highest enabled version, or the built-in default (version 0) when
    /// nothing is configured.
    async fn effective(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
    ) -> Result<EffectivePolicy, RepositoryError>;

    /// Append a new version row; versions are assigned atomically and never
    /// reused.
    async fn put_version(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
        config: PolicyConfig,
        updated_by: &str,
        enabled: bool,
    ) -> Result<PolicyDocument, RepositoryError>;

    async fn list_versions(
        &self,
        organization_id: &OrganizationId,
        policy_name: &str,
    ) -> Result<Vec<PolicyDocument>, RepositoryError>;
}
