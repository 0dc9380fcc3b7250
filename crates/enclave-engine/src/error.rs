use enclave_shared::error::ParseError;
use enclave_store::StoreError;
use thiserror::Error;

/// Errors surfaced to callers of the engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input; rejected before anything is persisted.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The caller may not see or change the target.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Persistence failed. Nothing was fanned out.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EngineError {
    /// Stable machine-readable code used in error frames.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::NotFound(_) => "not_found",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    pub(crate) fn forbidden(message: impl Into<String>) -> Self {
        EngineError::Forbidden(message.into())
    }

    pub(crate) fn not_found(what: impl std::fmt::Display) -> Self {
        EngineError::NotFound(what.to_string())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => EngineError::NotFound("record".into()),
            StoreError::Invalid(msg) => EngineError::Validation(msg),
            other => {
                tracing::error!(error = %other, "store failure");
                EngineError::StoreUnavailable(other.to_string())
            }
        }
    }
}

impl From<ParseError> for EngineError {
    fn from(e: ParseError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
