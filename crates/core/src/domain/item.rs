use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApItemId(pub String);

impl ApItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrganizationId(pub String);

/// Lifecycle states of an AP item. `Closed` and `Rejected` are terminal;
/// items are never physically deleted once terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApState {
    Received,
    Validated,
    NeedsInfo,
    NeedsApproval,
    Approved,
    ReadyToPost,
    /// In-flight marker: the item has been claimed for posting via
    /// check-and-set and the external call has not resolved yet.
    Posting,
    FailedPost,
    Closed,
    Rejected,
}

impl ApState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::NeedsInfo => "needs_info",
            Self::NeedsApproval => "needs_approval",
            Self::Approved => "approved",
            Self::ReadyToPost => "ready_to_post",
            Self::Posting => "posting",
            Self::FailedPost => "failed_post",
            Self::Closed => "closed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "received" => Some(Self::Received),
            "validated" => Some(Self::Validated),
            "needs_info" => Some(Self::NeedsInfo),
            "needs_approval" => Some(Self::NeedsApproval),
            "approved" => Some(Self::Approved),
            "ready_to_post" => Some(Self::ReadyToPost),
            "posting" => Some(Self::Posting),
            "failed_post" => Some(Self::FailedPost),
            "closed" => Some(Self::Closed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Rejected)
    }

    /// States from which a reject is structurally legal. The post-started
    /// guard is checked separately against `post_attempted_at`.
    pub fn is_reject_eligible(&self) -> bool {
        matches!(
            self,
            Self::Received
                | Self::Validated
                | Self::NeedsInfo
                | Self::NeedsApproval
                | Self::Approved
        )
    }
}

/// Well-known derived facts about an item. The `extra` map carries
/// forward-compatible values that have not earned a typed field yet.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_severity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_snapshot: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_reason: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_context_conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_into_ap_item_id: Option<ApItemId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden_from_worklist: bool,
    /// Approver ids the validation gate demanded; all must confirm.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_approvers: Vec<String>,
    /// Actor ids that have confirmed approval so far.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvals_recorded: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApItem {
    pub id: ApItemId,
    pub organization_id: OrganizationId,
    /// Correlation identity derived from vendor, invoice number, amount and
    /// due date. Empty when the detection carried no invoice number.
    pub invoice_key: String,
    pub vendor_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub invoice_number: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub confidence: f64,
    pub state: ApState,
    pub approval_required: bool,
    pub post_attempted_at: Option<DateTime<Utc>>,
    pub erp_reference: Option<String>,
    pub metadata: ItemMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApItem {
    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::{ApState, ItemMetadata};

    #[test]
    fn state_round_trips_from_storage_encoding() {
        let cases = [
            ApState::Received,
            ApState::Validated,
            ApState::NeedsInfo,
            ApState::NeedsApproval,
            ApState::Approved,
            ApState::ReadyToPost,
            ApState::Posting,
            ApState::FailedPost,
            ApState::Closed,
            ApState::Rejected,
        ];

        for state in cases {
            assert_eq!(ApState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn terminal_states_are_not_reject_eligible() {
        assert!(!ApState::Closed.is_reject_eligible());
        assert!(!ApState::Rejected.is_reject_eligible());
        assert!(!ApState::ReadyToPost.is_reject_eligible());
        assert!(ApState::NeedsApproval.is_reject_eligible());
    }

    #[test]
    fn metadata_serializes_only_populated_fields() {
        let metadata = ItemMetadata { merge_reason: Some("invoice_number".to_string()), ..Default::default() };
        let json = serde_json::to_string(&metadata).expect("serialize");

        assert!(json.contains("merge_reason"));
        assert!(!json.contains("exception_code"));
        assert!(!json.contains("hidden_from_worklist"));
    }
}
