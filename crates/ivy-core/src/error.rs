//! Error kinds carried across component boundaries.
//!
//! Adapter and store internals use `anyhow` with context (they have no
//! meaningful taxonomy); everything crossing the service boundary is
//! classified into one of these kinds so the transport layer can map them
//! to status codes.

use thiserror::Error;

/// Result alias for service-boundary operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error kinds surfaced by the engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate entity, or the action is already running.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller does not own the referenced entity.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Malformed input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Valid input, but impermissible given current state (e.g. starting a
    /// subtask that is neither ready nor blocked on failure).
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// A state-machine edge that is not in the transition table.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The tracker or hosting binary is missing, or invoking it failed at
    /// the I/O level.
    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),

    /// The hosting API accepted the request but failed.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    /// Anything else.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    pub fn unprocessable(what: impl Into<String>) -> Self {
        Self::Unprocessable(what.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
