//! Explicit lifecycle state machines.

use crate::error::{DomainError, DomainResult};

/// A lifecycle state with an exhaustive transition table.
///
/// Implementations map every `(state, transition)` pair either to the target
/// state or to an error; there is no implicit fallthrough. Terminal states must
/// reject every transition.
pub trait Lifecycle: Copy + Eq + core::fmt::Debug + Send + Sync + 'static {
    type Transition: Copy + Eq + core::fmt::Debug;

    /// Look up the target state for `transition` in the table.
    fn next(self, transition: Self::Transition) -> DomainResult<Self>;

    /// Whether no further transition may ever be applied.
    fn is_terminal(self) -> bool;

    /// Check that `self` is the state a caller expected to find.
    fn expect(self, expected: Self) -> DomainResult<()> {
        if self == expected {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "state precondition failed (expected: {expected:?}, actual: {self:?})"
            )))
        }
    }
}

/// Build the error returned for a transition missing from a table.
pub fn rejected<S: core::fmt::Debug, T: core::fmt::Debug>(state: S, transition: T) -> DomainError {
    DomainError::invariant(format!("transition {transition:?} is not allowed from {state:?}"))
}
