//! Engine-wide error types.
//!
//! Business-rule violations carry a typed reason and leave storage
//! untouched; infrastructure failures wrap the backend error so the
//! HTTP layer can answer 5xx and let the caller (GitHub included)
//! retry the delivery.

use thiserror::Error;

use crate::submissions::TransitionError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("funder already has an active commitment on this bounty")]
    DuplicateCommitment,

    #[error("commitment token does not match the bounty token")]
    TokenMismatch,

    #[error("bounty is {status} and accepts no further changes")]
    TerminalBounty { status: &'static str },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("database error: {0}")]
    Database(String),

    #[error("external service error: {0}")]
    External(String),
}

impl EngineError {
    pub fn terminal_bounty(status: crate::models::BountyStatus) -> Self {
        EngineError::TerminalBounty {
            status: status.as_str(),
        }
    }

    /// Retryable failures: the caller should repeat the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Database(_) | EngineError::External(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(e: tokio_postgres::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for EngineError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        EngineError::Database(format!("connection pool: {e}"))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::External(e.to_string())
    }
}
