//! Error types for the policy engine.
//!
//! Follows ODF-REP: Library crates use `thiserror` for explicit error enums.
//! Backends speak `anyhow` internally; failures are folded into
//! [`PolicyError::PersistenceUnavailable`] at the store boundary.

use thiserror::Error;

/// Result type with policy-engine error.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Error types for policy engine operations.
///
/// Only [`PolicyError::InvalidInput`] is fatal to selection and ranking; the
/// other variants are surfaced to callers of durable writes and lookups.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// Caller input rejected before any state mutation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backing store unreachable or timed out after bounded retries.
    #[error("Persistence unavailable during {operation} after {attempts} attempt(s): {message}")]
    PersistenceUnavailable {
        /// Operation that failed (for example `policy.upsert`).
        operation: &'static str,
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Last backend error, rendered.
        message: String,
    },

    /// A lookup that requires presence found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Sampling was requested from an empty replay buffer.
    #[error("Replay buffer is empty")]
    EmptyReplayBuffer,
}

impl PolicyError {
    /// Build an [`PolicyError::InvalidInput`] from any displayable message.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Whether the error means the backing store could not be reached.
    #[must_use]
    pub fn is_persistence_unavailable(&self) -> bool {
        matches!(self, Self::PersistenceUnavailable { .. })
    }
}
