//! Entity persistence: repositories with compare-and-transition writes.
//!
//! Every state change made by the scheduling engine goes through
//! [`Repository::compare_and_transition`], which applies a mutation only if
//! the entity is still in the expected state. Concurrent timers, sweeps and
//! user actions therefore race safely: exactly one of them wins.

mod in_memory;

use std::sync::Arc;
use std::time::Duration;

use lessonflow_booking::{Booking, Lesson};
use lessonflow_core::{BookingId, DomainError, DomainResult, Entity};

use crate::lock::{DEFAULT_LOCK_TIMEOUT, LockTimeout};

pub use in_memory::InMemoryRepository;

/// Mutation applied under compare-and-transition.
pub type Mutation<'a, T> = &'a dyn Fn(&mut T) -> DomainResult<()>;

/// Persistence error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Lock or backend unavailable; worth retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Uniqueness violated (duplicate id or unique key).
    #[error("conflict: {0}")]
    Conflict(String),
    /// The mutation itself was rejected by the domain.
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<LockTimeout> for StoreError {
    fn from(err: LockTimeout) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Result of a compare-and-transition write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome<T> {
    /// State matched; the mutated entity was stored.
    Applied(T),
    /// State did not match; nothing was written. Carries the current entity.
    Mismatch(T),
    /// No entity with that id.
    NotFound,
}

impl<T> CasOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }
}

/// Repository abstraction over one entity type.
pub trait Repository<T: Entity>: Send + Sync {
    fn get(&self, id: &T::Id) -> Result<Option<T>, StoreError>;

    /// Insert a new entity. Rejects duplicate ids and duplicate unique keys.
    fn insert(&self, entity: T) -> Result<(), StoreError>;

    /// Atomically: if the entity is in `expected`, apply `mutate` and store
    /// the result. A failed mutation leaves the stored entity untouched.
    fn compare_and_transition(
        &self,
        id: &T::Id,
        expected: T::State,
        mutate: Mutation<'_, T>,
    ) -> Result<CasOutcome<T>, StoreError>;

    /// Look up an entity by its secondary unique key.
    fn find_by_unique_key(&self, key: &str) -> Result<Option<T>, StoreError>;

    /// Entities matching `filter` with an id strictly after `after`, in id
    /// order, at most `limit`. Pass the last id of one page to read the next.
    fn scan(
        &self,
        after: Option<&T::Id>,
        filter: &dyn Fn(&T) -> bool,
        limit: usize,
    ) -> Result<Vec<T>, StoreError>;
}

impl<T: Entity, R: Repository<T> + ?Sized> Repository<T> for Arc<R> {
    fn get(&self, id: &T::Id) -> Result<Option<T>, StoreError> {
        (**self).get(id)
    }

    fn insert(&self, entity: T) -> Result<(), StoreError> {
        (**self).insert(entity)
    }

    fn compare_and_transition(
        &self,
        id: &T::Id,
        expected: T::State,
        mutate: Mutation<'_, T>,
    ) -> Result<CasOutcome<T>, StoreError> {
        (**self).compare_and_transition(id, expected, mutate)
    }

    fn find_by_unique_key(&self, key: &str) -> Result<Option<T>, StoreError> {
        (**self).find_by_unique_key(key)
    }

    fn scan(
        &self,
        after: Option<&T::Id>,
        filter: &dyn Fn(&T) -> bool,
        limit: usize,
    ) -> Result<Vec<T>, StoreError> {
        (**self).scan(after, filter, limit)
    }
}

/// The entity store the engine reads and transitions.
#[derive(Clone)]
pub struct EntityStore {
    pub bookings: Arc<dyn Repository<Booking>>,
    pub lessons: Arc<dyn Repository<Lesson>>,
}

impl EntityStore {
    pub fn new(
        bookings: Arc<dyn Repository<Booking>>,
        lessons: Arc<dyn Repository<Lesson>>,
    ) -> Self {
        Self { bookings, lessons }
    }

    /// In-memory store for tests/dev.
    pub fn in_memory() -> Self {
        Self::in_memory_with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn in_memory_with_lock_timeout(timeout: Duration) -> Self {
        Self {
            bookings: Arc::new(InMemoryRepository::<Booking>::with_lock_timeout(timeout)),
            lessons: Arc::new(InMemoryRepository::<Lesson>::with_lock_timeout(timeout)),
        }
    }

    /// The lesson materialised for `booking_id`, if any.
    pub fn lesson_for_booking(&self, booking_id: BookingId) -> Result<Option<Lesson>, StoreError> {
        self.lessons.find_by_unique_key(&Lesson::booking_key(booking_id))
    }
}

impl std::fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityStore").finish_non_exhaustive()
    }
}
