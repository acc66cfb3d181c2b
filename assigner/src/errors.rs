use crate::config::ValidationError;
use hyper::StatusCode;
use thiserror::Error;

/// Result type alias for assigner service operations
pub type Result<T, E = AssignerError> = std::result::Result<T, E>;

/// Validation failures of a single assignment call.
///
/// Both are caller errors detected before any hashing takes place and are
/// never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignError {
    /// Malformed test name
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Empty variant map, zero weight or a weight total that does not fit
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Errors that can occur while serving assignment requests
#[derive(Error, Debug)]
pub enum AssignerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Assign(#[from] AssignError),

    #[error("invalid service configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("unknown experiment: {0}")]
    UnknownExperiment(String),

    #[error("missing test parameter")]
    MissingTestParameter,

    #[error("invalid consent value {0:?}, expected granted or revoked")]
    InvalidConsent(String),

    #[error("could not determine client identity")]
    MissingIdentity,
}

impl AssignerError {
    /// Status code used when the error is returned to an HTTP client
    pub fn status_code(&self) -> StatusCode {
        match self {
            AssignerError::Assign(_)
            | AssignerError::MissingTestParameter
            | AssignerError::InvalidConsent(_)
            | AssignerError::MissingIdentity => StatusCode::BAD_REQUEST,
            AssignerError::UnknownExperiment(_) => StatusCode::NOT_FOUND,
            AssignerError::Io(_) | AssignerError::Validation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short tag for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            AssignerError::Assign(AssignError::InvalidArgument(_)) => "invalid_argument",
            AssignerError::Assign(AssignError::InvalidConfiguration(_)) => "invalid_configuration",
            AssignerError::UnknownExperiment(_) => "unknown_experiment",
            AssignerError::MissingTestParameter => "missing_test",
            AssignerError::InvalidConsent(_) => "invalid_consent",
            AssignerError::MissingIdentity => "missing_identity",
            AssignerError::Io(_) | AssignerError::Validation(_) => "internal",
        }
    }
}
