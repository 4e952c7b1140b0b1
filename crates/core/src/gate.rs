//! Validation gate: folds policy evaluation, PO match exceptions and budget
//! impact into a single pass/fail decision with machine-readable reasons.
//! The gate only classifies; it never mutates state.

use serde::{Deserialize, Serialize};

use crate::domain::validation::{BudgetImpactEntry, BudgetStatus, PoMatchException, ReasonCode};
use crate::policy::PolicyEvaluation;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateRoute {
    /// Gate passed; the item may auto-advance toward posting.
    AutoAdvance,
    /// Manual approval required before the item can move on.
    ManualApproval,
    /// Required invoice fields are missing; a human must supply them.
    NeedsInfo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub passed: bool,
    pub route: GateRoute,
    pub reason_codes: Vec<ReasonCode>,
    pub required_approvers: Vec<String>,
    pub summary: String,
}

#[derive(Clone, Debug)]
pub struct GateInput<'a> {
    pub policy: &'a PolicyEvaluation,
    pub po_exceptions: &'a [PoMatchException],
    pub budget_impact: &'a [BudgetImpactEntry],
    pub missing_fields: &'a [String],
    pub confidence: f64,
    pub auto_approval_threshold: f64,
    pub block_on_budget_overrun: bool,
}

/// Deterministic, side-effect-free classification of a candidate item.
pub fn evaluate(input: GateInput<'_>) -> GateDecision {
    let mut reason_codes = Vec::new();
    let mut hard_fail = false;

    if !input.missing_fields.is_empty() {
        return GateDecision {
            passed: false,
            route: GateRoute::NeedsInfo,
            reason_codes,
            required_approvers: Vec::new(),
            summary: format!("missing required fields: {}", input.missing_fields.join(", ")),
        };
    }

    for violation in &input.policy.violations {
        if violation.action == crate::domain::policy::PolicyActionKind::Block {
            hard_fail = true;
            reason_codes.push(ReasonCode::PolicyBlock { policy_id: violation.policy_id.clone() });
        } else {
            reason_codes.push(ReasonCode::PolicyApprovalRequired {
                policy_id: violation.policy_id.clone(),
            });
        }
    }

    for exception in input.po_exceptions {
        hard_fail = true;
        reason_codes.push(ReasonCode::PoException { code: exception.code.clone() });
    }

    for entry in input.budget_impact {
        match entry.after_approval_status {
            BudgetStatus::Exceeded => {
                hard_fail = true;
                reason_codes
                    .push(ReasonCode::BudgetExceeded { budget_line: entry.budget_line.clone() });
            }
            BudgetStatus::Critical if input.block_on_budget_overrun => {
                hard_fail = true;
                reason_codes
                    .push(ReasonCode::BudgetCritical { budget_line: entry.budget_line.clone() });
            }
            _ => {}
        }
    }

    let approval_required = !input.policy.compliant || hard_fail;
    let confident = input.confidence >= input.auto_approval_threshold;
    if !confident && !approval_required {
        reason_codes.push(ReasonCode::ConfidenceBelowThreshold);
    }

    let passed = !hard_fail && !approval_required && confident;
    let route = if passed { GateRoute::AutoAdvance } else { GateRoute::ManualApproval };

    GateDecision {
        passed,
        route,
        summary: summarize(passed, hard_fail, confident, &reason_codes),
        reason_codes,
        required_approvers: input.policy.required_approvers.clone(),
    }
}

fn summarize(passed: bool, hard_fail: bool, confident: bool, reasons: &[ReasonCode]) -> String {
    if passed {
        return "all checks passed; eligible for auto-approval".to_string();
    }
    if hard_fail {
        return format!("blocked: {} reason(s) force manual review", reasons.len());
    }
    if !confident {
        return "extraction confidence below auto-approval threshold".to_string();
    }
    format!("manual approval required ({} reason(s))", reasons.len())
}

#[cfg(test)]
mod tests {
    use super::{evaluate, GateInput, GateRoute};
    use crate::domain::policy::{PolicyActionKind, Severity, Violation};
    use crate::domain::validation::{
        BudgetImpactEntry, BudgetStatus, PoMatchException, ReasonCode,
    };
    use crate::policy::PolicyEvaluation;

    fn clean_policy() -> PolicyEvaluation {
        PolicyEvaluation {
            compliant: true,
            can_proceed: true,
            violations: Vec::new(),
            required_approvers: Vec::new(),
            parse_warnings: Vec::new(),
            summary: "compliant".to_string(),
        }
    }

    fn blocked_policy() -> PolicyEvaluation {
        PolicyEvaluation {
            compliant: false,
            can_proceed: false,
            violations: vec![Violation {
                policy_id: "blocked-vendor".to_string(),
                severity: Severity::Critical,
                action: PolicyActionKind::Block,
                message: "vendor is blocked".to_string(),
                required_approvers: Vec::new(),
            }],
            required_approvers: Vec::new(),
            parse_warnings: Vec::new(),
            summary: "1 violation".to_string(),
        }
    }

    fn input<'a>(policy: &'a PolicyEvaluation) -> GateInput<'a> {
        GateInput {
            policy,
            po_exceptions: &[],
            budget_impact: &[],
            missing_fields: &[],
            confidence: 0.95,
            auto_approval_threshold: 0.85,
            block_on_budget_overrun: false,
        }
    }

    #[test]
    fn clean_item_with_high_confidence_passes() {
        let policy = clean_policy();
        let decision = evaluate(input(&policy));

        assert!(decision.passed);
        assert_eq!(decision.route, GateRoute::AutoAdvance);
        assert!(decision.reason_codes.is_empty());
    }

    #[test]
    fn block_violation_forces_manual_routing() {
        let policy = blocked_policy();
        let decision = evaluate(input(&policy));

        assert!(!decision.passed);
        assert_eq!(decision.route, GateRoute::ManualApproval);
        assert!(matches!(decision.reason_codes[0], ReasonCode::PolicyBlock { .. }));
    }

    #[test]
    fn po_exception_fails_even_when_policy_is_clean() {
        let policy = clean_policy();
        let exceptions =
            [PoMatchException { code: "price_mismatch".to_string(), detail: "PO-7".to_string() }];
        let mut gate_input = input(&policy);
        gate_input.po_exceptions = &exceptions;

        let decision = evaluate(gate_input);

        assert!(!decision.passed);
        assert!(decision
            .reason_codes
            .iter()
            .any(|code| matches!(code, ReasonCode::PoException { code } if code == "price_mismatch")));
    }

    #[test]
    fn budget_critical_only_fails_with_overrun_flag() {
        let policy = clean_policy();
        let budget = [BudgetImpactEntry {
            budget_line: "opex".to_string(),
            after_approval_status: BudgetStatus::Critical,
        }];

        let mut lenient = input(&policy);
        lenient.budget_impact = &budget;
        assert!(evaluate(lenient).passed);

        let mut strict = input(&policy);
        strict.budget_impact = &budget;
        strict.block_on_budget_overrun = true;
        let decision = evaluate(strict);
        assert!(!decision.passed);
        assert!(matches!(decision.reason_codes[0], ReasonCode::BudgetCritical { .. }));
    }

    #[test]
    fn budget_exceeded_always_fails() {
        let policy = clean_policy();
        let budget = [BudgetImpactEntry {
            budget_line: "capex".to_string(),
            after_approval_status: BudgetStatus::Exceeded,
        }];
        let mut gate_input = input(&policy);
        gate_input.budget_impact = &budget;

        assert!(!evaluate(gate_input).passed);
    }

    #[test]
    fn low_confidence_routes_to_manual_approval() {
        let policy = clean_policy();
        let mut gate_input = input(&policy);
        gate_input.confidence = 0.40;

        let decision = evaluate(gate_input);

        assert!(!decision.passed);
        assert_eq!(decision.route, GateRoute::ManualApproval);
        assert!(decision
            .reason_codes
            .iter()
            .any(|code| matches!(code, ReasonCode::ConfidenceBelowThreshold)));
    }

    #[test]
    fn missing_fields_route_to_needs_info() {
        let policy = clean_policy();
        let missing = ["invoice_number".to_string()];
        let mut gate_input = input(&policy);
        gate_input.missing_fields = &missing;

        let decision = evaluate(gate_input);

        assert!(!decision.passed);
        assert_eq!(decision.route, GateRoute::NeedsInfo);
        assert!(decision.summary.contains("invoice_number"));
    }
}
