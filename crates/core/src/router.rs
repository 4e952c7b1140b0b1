//! Approval router: maps a gate decision to the channel and approvers that
//! must confirm. Notification delivery itself is an external collaborator.

use serde::{Deserialize, Serialize};

use crate::gate::{GateDecision, GateRoute};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalChannel {
    /// Gate passed; no human confirmation needed.
    None,
    /// Ask the item owner to supply the missing invoice fields.
    InfoRequest,
    /// Route to the organization's approval channel.
    Approval,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRoute {
    pub channel: ApprovalChannel,
    /// Actor ids that must all confirm; empty means any authorized approver.
    pub approvers: Vec<String>,
    pub reason_summary: String,
}

pub fn route(decision: &GateDecision) -> ApprovalRoute {
    let channel = match decision.route {
        GateRoute::AutoAdvance => ApprovalChannel::None,
        GateRoute::NeedsInfo => ApprovalChannel::InfoRequest,
        GateRoute::ManualApproval => ApprovalChannel::Approval,
    };

    ApprovalRoute {
        channel,
        approvers: decision.required_approvers.clone(),
        reason_summary: decision.summary.clone(),
    }
}

#[cfg(test)]
mod tests {
    use crate::gate::{GateDecision, GateRoute};

    use super::{route, ApprovalChannel};

    fn decision(gate_route: GateRoute, approvers: Vec<String>) -> GateDecision {
        GateDecision {
            passed: matches!(gate_route, GateRoute::AutoAdvance),
            route: gate_route,
            reason_codes: Vec::new(),
            required_approvers: approvers,
            summary: "summary".to_string(),
        }
    }

    #[test]
    fn passed_gate_routes_nowhere() {
        let routed = route(&decision(GateRoute::AutoAdvance, Vec::new()));
        assert_eq!(routed.channel, ApprovalChannel::None);
        assert!(routed.approvers.is_empty());
    }

    #[test]
    fn manual_route_carries_required_approvers() {
        let routed = route(&decision(
            GateRoute::ManualApproval,
            vec!["finance_manager".to_string(), "controller".to_string()],
        ));

        assert_eq!(routed.channel, ApprovalChannel::Approval);
        assert_eq!(routed.approvers.len(), 2);
    }

    #[test]
    fn missing_fields_route_to_info_request() {
        let routed = route(&decision(GateRoute::NeedsInfo, Vec::new()));
        assert_eq!(routed.channel, ApprovalChannel::InfoRequest);
    }
}
