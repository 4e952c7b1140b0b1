use thiserror::Error;

use crate::lifecycle::TransitionError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("unknown ap item `{0}`")]
    ItemNotFound(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Unauthorized { .. } => "The request could not be authenticated.",
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::Conflict { .. } => {
                "The request conflicts with the current state of the item."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Unauthorized { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(DomainError::ItemNotFound(message)) => Self::NotFound {
                message: format!("unknown ap item `{message}`"),
                correlation_id: "unassigned".to_owned(),
            },
            ApplicationError::Domain(DomainError::Transition(error)) => {
                let message = error.to_string();
                match error {
                    TransitionError::ConflictPostStarted
                    | TransitionError::AlreadyPosted { .. } => {
                        Self::Conflict { message, correlation_id: "unassigned".to_owned() }
                    }
                    TransitionError::InvalidState { .. }
                    | TransitionError::OverrideJustificationRequired => {
                        Self::BadRequest { message, correlation_id: "unassigned".to_owned() }
                    }
                }
            }
            ApplicationError::Domain(DomainError::InvariantViolation(message)) => {
                Self::BadRequest { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::item::ApState;
    use crate::errors::{ApplicationError, DomainError, InterfaceError};
    use crate::lifecycle::TransitionError;

    #[test]
    fn post_conflict_maps_to_conflict_interface_error() {
        let interface = ApplicationError::from(DomainError::Transition(
            TransitionError::ConflictPostStarted,
        ))
        .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::Conflict { ref correlation_id, .. } if correlation_id == "req-1"
        ));
    }

    #[test]
    fn invalid_state_maps_to_bad_request() {
        let interface = ApplicationError::from(DomainError::Transition(
            TransitionError::InvalidState { state: ApState::Closed, action: "reject" },
        ))
        .into_interface("req-2");

        assert!(matches!(interface, InterfaceError::BadRequest { .. }));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn unknown_item_maps_to_not_found() {
        let interface = ApplicationError::from(DomainError::ItemNotFound("item-9".to_owned()))
            .into_interface("req-3");

        assert!(matches!(interface, InterfaceError::NotFound { .. }));
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Persistence("database lock timeout".to_owned())
            .into_interface("req-4");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
    }
}
