pub mod engine;
pub mod states;

pub use engine::{TransitionEngine, TransitionError};
pub use states::{event_types, ActionContext, ApprovalRequest, TransitionOutcome};
