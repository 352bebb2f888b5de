use thiserror::Error;

/// Input rejected before any network call or state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid address `{value}`: {reason}")]
    InvalidAddress { value: String, reason: &'static str },
    #[error("invalid amount `{value}`: {reason}")]
    InvalidAmount { value: String, reason: &'static str },
    #[error("invalid transaction hash `{0}`")]
    InvalidHash(String),
}
