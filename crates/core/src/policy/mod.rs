//! Policy evaluator: runs the ordered rule list of a policy document against
//! a candidate item. Evaluation is pure and total; malformed rules are
//! dropped with a recorded warning instead of aborting.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::policy::{
    PolicyActionKind, PolicyDocument, PolicyRule, Severity, Violation,
};
use crate::domain::validation::BudgetImpactEntry;

/// Facts about the candidate item the rules are evaluated against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationInput {
    pub vendor_name: String,
    pub amount: Decimal,
    pub currency: String,
    pub category: Option<String>,
    pub has_purchase_order: bool,
    pub is_new_vendor: bool,
    pub budget_impact: Vec<BudgetImpactEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    /// No rule fired.
    pub compliant: bool,
    /// No `Block` violation present.
    pub can_proceed: bool,
    pub violations: Vec<Violation>,
    pub required_approvers: Vec<String>,
    pub parse_warnings: Vec<String>,
    pub summary: String,
}

pub fn evaluate(document: &PolicyDocument, input: &EvaluationInput) -> PolicyEvaluation {
    let parsed = document.config.parse_rules();
    let mut violations = Vec::new();

    for rule in &parsed.rules {
        if let Some(violation) = evaluate_rule(rule, input) {
            violations.push(violation);
        }
    }

    let mut required_approvers: Vec<String> = Vec::new();
    for violation in &violations {
        for approver in &violation.required_approvers {
            if !required_approvers.contains(approver) {
                required_approvers.push(approver.clone());
            }
        }
    }

    let compliant = violations.is_empty();
    let can_proceed =
        violations.iter().all(|violation| violation.action != PolicyActionKind::Block);

    let summary = if compliant {
        format!("compliant with policy {} v{}", document.policy_name, document.version)
    } else {
        let messages: Vec<&str> =
            violations.iter().map(|violation| violation.message.as_str()).collect();
        format!("{} violation(s): {}", violations.len(), messages.join("; "))
    };

    PolicyEvaluation {
        compliant,
        can_proceed,
        violations,
        required_approvers,
        parse_warnings: parsed.warnings,
        summary,
    }
}

fn evaluate_rule(rule: &PolicyRule, input: &EvaluationInput) -> Option<Violation> {
    match rule {
        PolicyRule::AmountThreshold { policy_id, threshold, action, required_approvers } => {
            (input.amount > *threshold).then(|| Violation {
                policy_id: policy_id.clone(),
                severity: severity_for(*action),
                action: *action,
                message: format!(
                    "amount {} {} exceeds threshold {}",
                    input.amount, input.currency, threshold
                ),
                required_approvers: required_approvers.clone(),
            })
        }
        PolicyRule::VendorThreshold {
            policy_id,
            vendor_name,
            threshold,
            action,
            required_approvers,
        } => (same_vendor(vendor_name, &input.vendor_name) && input.amount > *threshold).then(
            || Violation {
                policy_id: policy_id.clone(),
                severity: severity_for(*action),
                action: *action,
                message: format!(
                    "vendor {} amount {} exceeds vendor threshold {}",
                    input.vendor_name, input.amount, threshold
                ),
                required_approvers: required_approvers.clone(),
            },
        ),
        PolicyRule::VendorBlock { policy_id, vendor_name, reason } => {
            same_vendor(vendor_name, &input.vendor_name).then(|| Violation {
                policy_id: policy_id.clone(),
                severity: Severity::Critical,
                action: PolicyActionKind::Block,
                message: reason
                    .clone()
                    .unwrap_or_else(|| format!("vendor {} is blocked", input.vendor_name)),
                required_approvers: Vec::new(),
            })
        }
        PolicyRule::CategoryApproval { policy_id, category, required_approvers } => input
            .category
            .as_deref()
            .is_some_and(|candidate| candidate.eq_ignore_ascii_case(category))
            .then(|| Violation {
                policy_id: policy_id.clone(),
                severity: Severity::Warning,
                action: PolicyActionKind::RequireApproval,
                message: format!("category {category} requires approval"),
                required_approvers: required_approvers.clone(),
            }),
        PolicyRule::PoRequiredAbove { policy_id, threshold } => {
            (input.amount > *threshold && !input.has_purchase_order).then(|| Violation {
                policy_id: policy_id.clone(),
                severity: Severity::Warning,
                action: PolicyActionKind::RequirePo,
                message: format!(
                    "purchase order required for amounts above {threshold}"
                ),
                required_approvers: Vec::new(),
            })
        }
        PolicyRule::NewVendorApproval { policy_id, required_approvers } => {
            input.is_new_vendor.then(|| Violation {
                policy_id: policy_id.clone(),
                severity: Severity::Warning,
                action: PolicyActionKind::RequireApproval,
                message: format!("first invoice from vendor {}", input.vendor_name),
                required_approvers: required_approvers.clone(),
            })
        }
        PolicyRule::BudgetStatus { policy_id, status, action } => input
            .budget_impact
            .iter()
            .find(|entry| entry.after_approval_status.as_str() == status.as_str())
            .map(|entry| Violation {
                policy_id: policy_id.clone(),
                severity: severity_for(*action),
                action: *action,
                message: format!(
                    "budget line {} would be {} after approval",
                    entry.budget_line, status
                ),
                required_approvers: Vec::new(),
            }),
    }
}

fn severity_for(action: PolicyActionKind) -> Severity {
    match action {
        PolicyActionKind::Block => Severity::Critical,
        PolicyActionKind::RequireMultiApproval => Severity::Warning,
        PolicyActionKind::RequireApproval
        | PolicyActionKind::RequirePo
        | PolicyActionKind::FlagForReview => Severity::Warning,
    }
}

fn same_vendor(configured: &str, candidate: &str) -> bool {
    configured.trim().eq_ignore_ascii_case(candidate.trim())
}
