use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::item::OrganizationId;

pub const DEFAULT_POLICY_NAME: &str = "ap_approval";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Blocking action a violated rule demands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyActionKind {
    RequireApproval,
    RequireMultiApproval,
    RequirePo,
    Block,
    FlagForReview,
}

/// Closed set of declarative rule shapes. Unknown `type` tags in a stored
/// config are dropped with a parse warning rather than aborting evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyRule {
    AmountThreshold {
        policy_id: String,
        threshold: Decimal,
        action: PolicyActionKind,
        #[serde(default)]
        required_approvers: Vec<String>,
    },
    VendorThreshold {
        policy_id: String,
        vendor_name: String,
        threshold: Decimal,
        action: PolicyActionKind,
        #[serde(default)]
        required_approvers: Vec<String>,
    },
    VendorBlock {
        policy_id: String,
        vendor_name: String,
        #[serde(default)]
        reason: Option<String>,
    },
    CategoryApproval {
        policy_id: String,
        category: String,
        #[serde(default)]
        required_approvers: Vec<String>,
    },
    PoRequiredAbove {
        policy_id: String,
        threshold: Decimal,
    },
    NewVendorApproval {
        policy_id: String,
        #[serde(default)]
        required_approvers: Vec<String>,
    },
    BudgetStatus {
        policy_id: String,
        status: String,
        action: PolicyActionKind,
    },
}

impl PolicyRule {
    pub fn policy_id(&self) -> &str {
        match self {
            Self::AmountThreshold { policy_id, .. }
            | Self::VendorThreshold { policy_id, .. }
            | Self::VendorBlock { policy_id, .. }
            | Self::CategoryApproval { policy_id, .. }
            | Self::PoRequiredAbove { policy_id, .. }
            | Self::NewVendorApproval { policy_id, .. }
            | Self::BudgetStatus { policy_id, .. } => policy_id,
        }
    }
}

/// Parsed body of a policy document version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_auto_approval_threshold")]
    pub auto_approval_threshold: f64,
    #[serde(default)]
    pub block_on_budget_overrun: bool,
    /// Raw rule values; decoded individually so one malformed rule cannot
    /// poison the rest of the document.
    #[serde(default)]
    pub rules: Vec<serde_json::Value>,
}

fn default_auto_approval_threshold() -> f64 {
    0.85
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_approval_threshold: default_auto_approval_threshold(),
            block_on_budget_overrun: false,
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedRules {
    pub rules: Vec<PolicyRule>,
    pub warnings: Vec<String>,
}

impl PolicyConfig {
    /// Decode rule values one at a time, keeping the good ones.
    pub fn parse_rules(&self) -> ParsedRules {
        let mut rules = Vec::with_capacity(self.rules.len());
        let mut warnings = Vec::new();

        for (index, raw) in self.rules.iter().enumerate() {
            match serde_json::from_value::<PolicyRule>(raw.clone()) {
                Ok(rule) => rules.push(rule),
                Err(error) => {
                    warnings.push(format!("rule[{index}] dropped: {error}"));
                }
            }
        }

        ParsedRules { rules, warnings }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub organization_id: OrganizationId,
    pub policy_name: String,
    pub version: i64,
    pub config: PolicyConfig,
    pub enabled: bool,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
}

impl PolicyDocument {
    /// Built-in default document, version 0. Returned whenever no enabled
    /// version exists for the organization.
    pub fn built_in_default(organization_id: OrganizationId, policy_name: &str) -> Self {
        Self {
            organization_id,
            policy_name: policy_name.to_string(),
            version: 0,
            config: PolicyConfig::default(),
            enabled: true,
            updated_by: "system".to_string(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Outcome of a policy read: callers can tell a configured document from the
/// built-in fallback without catching errors.
#[derive(Clone, Debug, PartialEq)]
pub enum EffectivePolicy {
    Configured(PolicyDocument),
    BuiltInDefault(PolicyDocument),
}

impl EffectivePolicy {
    pub fn document(&self) -> &PolicyDocument {
        match self {
            Self::Configured(doc) | Self::BuiltInDefault(doc) => doc,
        }
    }

    pub fn into_document(self) -> PolicyDocument {
        match self {
            Self::Configured(doc) | Self::BuiltInDefault(doc) => doc,
        }
    }

    pub fn is_configured(&self) -> bool {
        matches!(self, Self::Configured(_))
    }
}

/// A rule that fired against a candidate item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub policy_id: String,
    pub severity: Severity,
    pub action: PolicyActionKind,
    pub message: String,
    #[serde(default)]
    pub required_approvers: Vec<String>,
}
