use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown conversation kind: {0}")]
    UnknownKind(String),

    #[error("Unknown membership role: {0}")]
    UnknownRole(String),

    #[error("Unknown delivery state: {0}")]
    UnknownDeliveryState(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}
