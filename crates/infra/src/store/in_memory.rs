use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Duration;

use lessonflow_core::{Entity, Lifecycle};

use crate::lock::{DEFAULT_LOCK_TIMEOUT, TimedMutex};

use super::{CasOutcome, Mutation, Repository, StoreError};

#[derive(Debug)]
struct Table<T: Entity> {
    rows: BTreeMap<T::Id, T>,
    unique: HashMap<String, T::Id>,
}

/// In-memory repository for tests/dev.
#[derive(Debug)]
pub struct InMemoryRepository<T: Entity> {
    table: TimedMutex<Table<T>>,
}

impl<T: Entity> InMemoryRepository<T>
where
    T::Id: Ord,
{
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            table: TimedMutex::new(
                Table {
                    rows: BTreeMap::new(),
                    unique: HashMap::new(),
                },
                timeout,
            ),
        }
    }
}

impl<T: Entity> Default for InMemoryRepository<T>
where
    T::Id: Ord,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Repository<T> for InMemoryRepository<T>
where
    T: Entity + Clone + Send + Sync,
    T::Id: Ord + Send + Sync,
{
    fn get(&self, id: &T::Id) -> Result<Option<T>, StoreError> {
        let table = self.table.acquire()?;
        Ok(table.rows.get(id).cloned())
    }

    fn insert(&self, entity: T) -> Result<(), StoreError> {
        let mut table = self.table.acquire()?;
        let id = *entity.id();
        if table.rows.contains_key(&id) {
            return Err(StoreError::Conflict(format!("{id} already exists")));
        }
        if let Some(key) = entity.unique_key() {
            if let Some(owner) = table.unique.get(&key) {
                return Err(StoreError::Conflict(format!("{key} is already taken by {owner}")));
            }
            table.unique.insert(key, id);
        }
        table.rows.insert(id, entity);
        Ok(())
    }

    fn compare_and_transition(
        &self,
        id: &T::Id,
        expected: T::State,
        mutate: Mutation<'_, T>,
    ) -> Result<CasOutcome<T>, StoreError> {
        let mut table = self.table.acquire()?;
        let Some(current) = table.rows.get(id) else {
            return Ok(CasOutcome::NotFound);
        };
        if current.state().expect(expected).is_err() {
            return Ok(CasOutcome::Mismatch(current.clone()));
        }

        let mut next = current.clone();
        mutate(&mut next)?;

        let old_key = current.unique_key();
        let new_key = next.unique_key();
        if old_key != new_key {
            if let Some(key) = &new_key {
                if table.unique.get(key).is_some_and(|owner| owner != id) {
                    return Err(StoreError::Conflict(format!("{key} is already taken")));
                }
            }
            if let Some(key) = old_key {
                table.unique.remove(&key);
            }
            if let Some(key) = new_key {
                table.unique.insert(key, *id);
            }
        }

        table.rows.insert(*id, next.clone());
        Ok(CasOutcome::Applied(next))
    }

    fn find_by_unique_key(&self, key: &str) -> Result<Option<T>, StoreError> {
        let table = self.table.acquire()?;
        Ok(table.unique.get(key).and_then(|id| table.rows.get(id)).cloned())
    }

    fn scan(
        &self,
        after: Option<&T::Id>,
        filter: &dyn Fn(&T) -> bool,
        limit: usize,
    ) -> Result<Vec<T>, StoreError> {
        let table = self.table.acquire()?;
        let lower = after.map_or(Bound::Unbounded, |id| Bound::Excluded(*id));
        Ok(table
            .rows
            .range((lower, Bound::Unbounded))
            .map(|(_, e)| e)
            .filter(|e| filter(e))
            .take(limit)
            .cloned()
            .collect())
    }
}
