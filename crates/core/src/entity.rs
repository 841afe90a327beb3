//! Entity trait: identity + continuity across state changes.

use crate::lifecycle::Lifecycle;

/// Entity with identity and an explicit lifecycle state.
///
/// Repositories use `state()` for compare-and-transition checks and
/// `unique_key()` for secondary uniqueness (e.g. one lesson per booking).
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Copy + Ord + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    /// Lifecycle state of the entity.
    type State: Lifecycle;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Returns the current lifecycle state.
    fn state(&self) -> Self::State;

    /// Optional secondary key that must be unique across the repository.
    fn unique_key(&self) -> Option<String> {
        None
    }
}
