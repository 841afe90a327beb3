//! Errors raised by booking and lesson domain types.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic domain failures. Storage and queue errors live in infra.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Input that can never form a valid entity (zero duration, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A transition missing from the entity's lifecycle table.
    #[error("transition rejected: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The entity is not in the state the caller planned against.
    #[error("state conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Whether the entity simply moved on (rejected or unexpected state),
    /// as opposed to the input being unusable.
    pub fn is_state_mismatch(&self) -> bool {
        matches!(self, Self::InvariantViolation(_) | Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mismatches_are_told_apart_from_bad_input() {
        assert!(DomainError::invariant("Complete from Pending").is_state_mismatch());
        assert!(DomainError::conflict("expected Confirmed").is_state_mismatch());
        assert!(!DomainError::validation("duration must be positive").is_state_mismatch());
        assert!(!DomainError::invalid_id("LessonId: bad").is_state_mismatch());
    }
}
