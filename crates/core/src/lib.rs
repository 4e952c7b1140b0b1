pub mod audit;
pub mod config;
pub mod correlation;
pub mod domain;
pub mod errors;
pub mod gate;
pub mod lifecycle;
pub mod policy;
pub mod reconciler;
pub mod router;
pub mod signing;

pub use audit::{ActorType, AuditEvent};
pub use correlation::{
    correlate, invoice_key, CorrelationConfig, CorrelationDecision, Detection, MergeReason,
    OpenItemCandidate,
};
pub use domain::item::{ApItem, ApItemId, ApState, ItemMetadata, OrganizationId};
pub use domain::policy::{
    EffectivePolicy, PolicyConfig, PolicyDocument, PolicyRule, Severity, Violation,
    DEFAULT_POLICY_NAME,
};
pub use domain::source::{Source, SourceDescriptor, SourceId, SourceType};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use gate::{GateDecision, GateInput, GateRoute};
pub use lifecycle::{
    event_types, ActionContext, ApprovalRequest, TransitionEngine, TransitionError,
    TransitionOutcome,
};
pub use policy::{EvaluationInput, PolicyEvaluation};
pub use reconciler::{escalation_key, find_escalations, Escalation, SlaConfig};
pub use router::{route, ApprovalChannel, ApprovalRoute};
