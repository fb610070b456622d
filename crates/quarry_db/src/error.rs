//! Error types for the backend layer.

use thiserror::Error;

/// Backend operation result type.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Backend errors, classified by kind.
///
/// Callers branch on the variant, never on the message: a query killed through
/// [`crate::DatabaseAdapter::abort_query`] is `Cancelled`, a malformed table or
/// query reference is `Programming`, everything else the engine reports is
/// `Operational`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Engine failure (connection lost, timeout, resource exhausted, ...)
    #[error("Operational error: {0}")]
    Operational(String),

    /// Invalid SQL, unknown table or column, type mismatch
    #[error("Programming error: {0}")]
    Programming(String),

    /// The backend process running the query was killed
    #[error("Query cancelled: {0}")]
    Cancelled(String),

    /// The adapter does not implement the operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl AdapterError {
    pub fn operational(msg: impl Into<String>) -> Self {
        Self::Operational(msg.into())
    }

    pub fn programming(msg: impl Into<String>) -> Self {
        Self::Programming(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// True when the error was caused by `abort_query`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_programming(&self) -> bool {
        matches!(self, Self::Programming(_))
    }
}
