//! Error types for union coordination.

use crate::types::Timestamp;
use thiserror::Error;

/// Main error type for union operations.
#[derive(Debug, Error)]
pub enum UnionError {
    /// A `load_initial` / `load_by_token` hook failed.
    #[error("Load failed: {0}")]
    Load(String),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Decoding error: {0}")]
    Decode(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("lastSubscribed {0:?} is older than the maximum age")]
    LastSubscribedTooOld(Timestamp),

    /// The signal channel of a waiting subscriber closed without a result.
    #[error("Load pass abandoned")]
    PassAbandoned,

    #[error("Transaction error: {0}")]
    Transaction(String),
}

impl UnionError {
    /// Shorthand for hook implementations.
    pub fn load(msg: impl Into<String>) -> Self {
        UnionError::Load(msg.into())
    }
}

impl From<rmp_serde::encode::Error> for UnionError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        UnionError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for UnionError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        UnionError::Decode(e.to_string())
    }
}

/// Result type for union operations.
pub type Result<T> = std::result::Result<T, UnionError>;
