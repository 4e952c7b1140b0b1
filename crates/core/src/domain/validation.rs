use serde::{Deserialize, Serialize};

/// Purchase-order match exception reported by the matching collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoMatchException {
    /// Machine-readable code, e.g. `price_mismatch`, `quantity_mismatch`,
    /// `po_not_found`.
    pub code: String,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Healthy,
    Warning,
    Critical,
    Exceeded,
}

impl BudgetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Exceeded => "exceeded",
        }
    }
}

/// Projected effect of approving the item on one budget line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetImpactEntry {
    pub budget_line: String,
    pub after_approval_status: BudgetStatus,
}

/// Machine-readable reasons a validation gate decision carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    PolicyBlock { policy_id: String },
    PolicyApprovalRequired { policy_id: String },
    PoException { code: String },
    BudgetExceeded { budget_line: String },
    BudgetCritical { budget_line: String },
    ConfidenceBelowThreshold,
}
