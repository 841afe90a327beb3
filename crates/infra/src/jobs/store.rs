//! Job storage implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::lock::{DEFAULT_LOCK_TIMEOUT, LockTimeout, TimedMutex};

use super::types::{DeadLetterEntry, JobId, JobStatus, ScheduledJob, SubjectId, SubjectKind};

/// Job store abstraction.
///
/// At most one *pending* job (status `Pending` or `Failed`) may exist per
/// `(subject_id, action_key)`; `enqueue` rejects a second one with
/// [`JobStoreError::Duplicate`].
pub trait JobStore: Send + Sync {
    /// Enqueue a new job.
    fn enqueue(&self, job: ScheduledJob) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<ScheduledJob>, JobStoreError>;

    /// Update a job.
    ///
    /// A job that would come back pending while another job holds its
    /// `(subject_id, action_key)` is stored as cancelled instead.
    fn update(&self, job: &ScheduledJob) -> Result<(), JobStoreError>;

    /// Claim the earliest due job, leasing it for `lease`.
    /// Returns None if nothing is due.
    fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<ScheduledJob>, JobStoreError>;

    /// Cancel pending jobs of `subject_id` whose action key starts with
    /// `action_prefix`. Returns how many were cancelled.
    fn cancel_where(
        &self,
        subject_id: SubjectId,
        action_prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError>;

    /// Pending jobs of one subject, by trigger time.
    fn pending_for(&self, subject_id: SubjectId) -> Result<Vec<ScheduledJob>, JobStoreError>;

    /// Next pending triggers across all subjects.
    fn upcoming(&self, limit: usize) -> Result<Vec<UpcomingTrigger>, JobStoreError>;

    /// Make running jobs whose lease expired deliverable again, cancelling
    /// any whose key was planned afresh meanwhile.
    /// Returns how many leases expired.
    fn requeue_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError>;

    /// Move a job to the dead-letter queue.
    fn dead_letter(
        &self,
        job: ScheduledJob,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// List dead-lettered jobs, oldest first.
    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Retry a dead-lettered job (move back to pending, due at `now`).
    fn retry_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob, JobStoreError>;

    /// Delete a dead-lettered job.
    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Drop finished jobs last touched before `before`. Returns how many.
    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, JobStoreError>;

    /// Get job statistics.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("a pending {action_key} job already exists for {subject_id}")]
    Duplicate {
        subject_id: SubjectId,
        action_key: String,
    },
    #[error("job store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Transient errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_))
    }
}

impl From<LockTimeout> for JobStoreError {
    fn from(err: LockTimeout) -> Self {
        JobStoreError::Unavailable(err.to_string())
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub cancelled: usize,
}

/// A pending trigger, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpcomingTrigger {
    pub job_id: JobId,
    pub subject_id: SubjectId,
    pub subject_kind: SubjectKind,
    pub action_key: String,
    pub trigger_at: DateTime<Utc>,
    pub attempt: u32,
}

impl From<&ScheduledJob> for UpcomingTrigger {
    fn from(job: &ScheduledJob) -> Self {
        Self {
            job_id: job.id,
            subject_id: job.subject_id,
            subject_kind: job.subject_kind,
            action_key: job.action_key(),
            trigger_at: job.trigger_at,
            attempt: job.attempt,
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    jobs: HashMap<JobId, ScheduledJob>,
    dead_letters: HashMap<JobId, DeadLetterEntry>,
}

impl Queue {
    fn has_pending(&self, subject_id: SubjectId, action_key: &str) -> bool {
        self.jobs.values().any(|j| {
            j.status.is_pending() && j.subject_id == subject_id && j.action_key() == action_key
        })
    }

    /// Whether a job other than `job` already holds its pending slot.
    fn slot_taken(&self, job: &ScheduledJob) -> bool {
        let action_key = job.action_key();
        self.jobs.values().any(|j| {
            j.id != job.id
                && j.status.is_pending()
                && j.subject_id == job.subject_id
                && j.action_key() == action_key
        })
    }

    /// Cancel `job` when it would become a second pending job for its key.
    ///
    /// A running job does not hold the slot, so its handler may plan a
    /// replacement; the original coming back for a retry then loses.
    fn supersede_if_taken(&self, job: &mut ScheduledJob) {
        if job.status.is_pending() && self.slot_taken(job) {
            debug!(
                job_id = %job.id,
                action = %job.action_key(),
                "pending slot already taken, cancelling superseded job"
            );
            let now = job.updated_at;
            job.mark_cancelled(now);
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug)]
pub struct InMemoryJobStore {
    queue: TimedMutex<Queue>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            queue: TimedMutex::new(Queue::default(), timeout),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn enqueue(&self, job: ScheduledJob) -> Result<JobId, JobStoreError> {
        let mut queue = self.queue.acquire()?;
        if queue.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let action_key = job.action_key();
        if queue.has_pending(job.subject_id, &action_key) {
            return Err(JobStoreError::Duplicate {
                subject_id: job.subject_id,
                action_key,
            });
        }
        let id = job.id;
        queue.jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<ScheduledJob>, JobStoreError> {
        let queue = self.queue.acquire()?;
        Ok(queue.jobs.get(&job_id).cloned())
    }

    fn update(&self, job: &ScheduledJob) -> Result<(), JobStoreError> {
        let mut queue = self.queue.acquire()?;
        if !queue.jobs.contains_key(&job.id) {
            return Err(JobStoreError::NotFound(job.id));
        }
        let mut job = job.clone();
        queue.supersede_if_taken(&mut job);
        queue.jobs.insert(job.id, job);
        Ok(())
    }

    fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<ScheduledJob>, JobStoreError> {
        let mut queue = self.queue.acquire()?;

        // Earliest trigger first; creation order breaks ties.
        let next = queue
            .jobs
            .values()
            .filter(|j| j.is_ready(now))
            .min_by_key(|j| (j.trigger_at, j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            queue.jobs.get_mut(&id).map(|job| {
                job.mark_running(now, lease);
                job.clone()
            })
        }))
    }

    fn cancel_where(
        &self,
        subject_id: SubjectId,
        action_prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        let mut queue = self.queue.acquire()?;
        let mut cancelled = 0;
        for job in queue.jobs.values_mut() {
            if job.subject_id == subject_id
                && job.status.is_pending()
                && job.action_key().starts_with(action_prefix)
            {
                job.mark_cancelled(now);
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    fn pending_for(&self, subject_id: SubjectId) -> Result<Vec<ScheduledJob>, JobStoreError> {
        let queue = self.queue.acquire()?;
        let mut result: Vec<_> = queue
            .jobs
            .values()
            .filter(|j| j.subject_id == subject_id && j.status.is_pending())
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.trigger_at, j.created_at));
        Ok(result)
    }

    fn upcoming(&self, limit: usize) -> Result<Vec<UpcomingTrigger>, JobStoreError> {
        let queue = self.queue.acquire()?;
        let mut pending: Vec<_> = queue.jobs.values().filter(|j| j.status.is_pending()).collect();
        pending.sort_by_key(|j| (j.trigger_at, j.created_at));
        Ok(pending.into_iter().take(limit).map(UpcomingTrigger::from).collect())
    }

    fn requeue_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut queue = self.queue.acquire()?;

        let expired: Vec<JobId> = queue
            .jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Running)
                    && j.lease_expires_at.is_some_and(|lease| lease <= now)
            })
            .map(|j| j.id)
            .collect();

        for id in &expired {
            let Some(mut job) = queue.jobs.remove(id) else {
                continue;
            };
            let started_at = job.updated_at;
            job.mark_failed("lease expired".to_string(), started_at, now);
            if let JobStatus::DeadLettered { error, .. } = &job.status {
                let reason = error.clone();
                queue.dead_letters.insert(job.id, DeadLetterEntry::new(job, reason, now));
            } else {
                // Deliver again right away rather than after backoff.
                job.trigger_at = now;
                queue.supersede_if_taken(&mut job);
                queue.jobs.insert(job.id, job);
            }
        }

        Ok(expired.len())
    }

    fn dead_letter(
        &self,
        mut job: ScheduledJob,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut queue = self.queue.acquire()?;

        job.status = JobStatus::DeadLettered {
            error: reason.clone(),
            attempts: job.attempt,
        };
        job.updated_at = now;
        job.lease_expires_at = None;

        queue.jobs.remove(&job.id);
        queue
            .dead_letters
            .insert(job.id, DeadLetterEntry::new(job, reason, now));

        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let queue = self.queue.acquire()?;
        let mut result: Vec<_> = queue.dead_letters.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob, JobStoreError> {
        let mut queue = self.queue.acquire()?;

        let entry = queue
            .dead_letters
            .get(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        let action_key = entry.job.action_key();
        let subject_id = entry.job.subject_id;
        if queue.has_pending(subject_id, &action_key) {
            return Err(JobStoreError::Duplicate {
                subject_id,
                action_key,
            });
        }

        let Some(entry) = queue.dead_letters.remove(&job_id) else {
            return Err(JobStoreError::NotFound(job_id));
        };
        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.trigger_at = now;
        job.updated_at = now;
        job.history.clear();

        queue.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut queue = self.queue.acquire()?;
        queue
            .dead_letters
            .remove(&job_id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut queue = self.queue.acquire()?;
        let len = queue.jobs.len();
        queue
            .jobs
            .retain(|_, j| !(j.status.is_terminal() && j.updated_at < before));
        Ok(len - queue.jobs.len())
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let queue = self.queue.acquire()?;

        let mut stats = JobStats::default();

        for job in queue.jobs.values() {
            match &job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Skipped { .. } => stats.skipped += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats.dead_lettered += queue.dead_letters.len();

        Ok(stats)
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn enqueue(&self, job: ScheduledJob) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<ScheduledJob>, JobStoreError> {
        (**self).get(job_id)
    }

    fn update(&self, job: &ScheduledJob) -> Result<(), JobStoreError> {
        (**self).update(job)
    }

    fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<ScheduledJob>, JobStoreError> {
        (**self).claim_next(now, lease)
    }

    fn cancel_where(
        &self,
        subject_id: SubjectId,
        action_prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        (**self).cancel_where(subject_id, action_prefix, now)
    }

    fn pending_for(&self, subject_id: SubjectId) -> Result<Vec<ScheduledJob>, JobStoreError> {
        (**self).pending_for(subject_id)
    }

    fn upcoming(&self, limit: usize) -> Result<Vec<UpcomingTrigger>, JobStoreError> {
        (**self).upcoming(limit)
    }

    fn requeue_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        (**self).requeue_expired_leases(now)
    }

    fn dead_letter(
        &self,
        job: ScheduledJob,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason, now)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<ScheduledJob, JobStoreError> {
        (**self).retry_dead_letter(job_id, now)
    }

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).delete_dead_letter(job_id)
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> Result<usize, JobStoreError> {
        (**self).purge_finished(before)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobAction, RetryPolicy};
    use chrono::TimeZone;
    use lessonflow_core::{BookingId, LessonId};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn lease() -> chrono::Duration {
        chrono::Duration::minutes(5)
    }

    fn expire(booking_id: BookingId, trigger_at: DateTime<Utc>) -> ScheduledJob {
        ScheduledJob::new(JobAction::ExpireBooking { booking_id }, trigger_at, t0())
    }

    #[test]
    fn enqueue_and_claim_only_when_due() {
        let store = InMemoryJobStore::new();
        let due = t0() + chrono::Duration::hours(1);
        let job_id = store.enqueue(expire(BookingId::new(), due)).unwrap();

        assert!(store.claim_next(t0(), lease()).unwrap().is_none());

        let claimed = store.claim_next(due, lease()).unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert!(matches!(claimed.status, JobStatus::Running));
        assert_eq!(claimed.attempt, 1);
        assert_eq!(claimed.lease_expires_at, Some(due + lease()));

        // No more jobs
        assert!(store.claim_next(due, lease()).unwrap().is_none());
    }

    #[test]
    fn claims_in_trigger_order() {
        let store = InMemoryJobStore::new();
        let late = store
            .enqueue(expire(BookingId::new(), t0() + chrono::Duration::minutes(10)))
            .unwrap();
        let early = store
            .enqueue(expire(BookingId::new(), t0() + chrono::Duration::minutes(5)))
            .unwrap();

        let now = t0() + chrono::Duration::hours(1);
        assert_eq!(store.claim_next(now, lease()).unwrap().unwrap().id, early);
        assert_eq!(store.claim_next(now, lease()).unwrap().unwrap().id, late);
    }

    #[test]
    fn rejects_second_pending_job_for_same_key() {
        let store = InMemoryJobStore::new();
        let booking_id = BookingId::new();
        store.enqueue(expire(booking_id, t0())).unwrap();

        let err = store.enqueue(expire(booking_id, t0())).unwrap_err();
        assert!(matches!(err, JobStoreError::Duplicate { ref action_key, .. } if action_key == "booking.expire"));

        // Once the first is cancelled a replacement is accepted.
        assert_eq!(store.cancel_where(booking_id.into(), "booking.", t0()).unwrap(), 1);
        assert!(store.enqueue(expire(booking_id, t0())).is_ok());
    }

    #[test]
    fn cancel_where_matches_subject_and_prefix() {
        let store = InMemoryJobStore::new();
        let booking_id = BookingId::new();
        let other = BookingId::new();
        store.enqueue(expire(booking_id, t0())).unwrap();
        store.enqueue(expire(other, t0())).unwrap();
        store
            .enqueue(ScheduledJob::new(
                JobAction::CreateLesson {
                    booking_id,
                    scheduled_at: t0(),
                },
                t0(),
                t0(),
            ))
            .unwrap();

        assert_eq!(store.cancel_where(booking_id.into(), "lesson.", t0()).unwrap(), 1);
        let left = store.pending_for(booking_id.into()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].action_key(), "booking.expire");
        assert_eq!(store.pending_for(other.into()).unwrap().len(), 1);
    }

    #[test]
    fn running_jobs_are_not_cancelled() {
        let store = InMemoryJobStore::new();
        let booking_id = BookingId::new();
        store.enqueue(expire(booking_id, t0())).unwrap();
        store.claim_next(t0(), lease()).unwrap().unwrap();

        assert_eq!(store.cancel_where(booking_id.into(), "", t0()).unwrap(), 0);
        // And a running job does not block planning a fresh one.
        assert!(store.enqueue(expire(booking_id, t0())).is_ok());
    }

    #[test]
    fn retried_job_yields_to_a_replacement_planned_while_it_ran() {
        let store = InMemoryJobStore::new();
        let booking_id = BookingId::new();
        let original = store.enqueue(expire(booking_id, t0())).unwrap();
        let mut running = store.claim_next(t0(), lease()).unwrap().unwrap();

        // The handler replans the same key, then fails transiently.
        let replacement = store
            .enqueue(expire(booking_id, t0() + chrono::Duration::hours(1)))
            .unwrap();
        running.mark_failed("store unavailable".to_string(), t0(), t0());
        store.update(&running).unwrap();

        let pending = store.pending_for(booking_id.into()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, replacement);
        assert!(matches!(store.get(original).unwrap().unwrap().status, JobStatus::Cancelled));
    }

    #[test]
    fn update_without_a_competing_job_keeps_the_retry() {
        let store = InMemoryJobStore::new();
        let booking_id = BookingId::new();
        store.enqueue(expire(booking_id, t0())).unwrap();
        let mut running = store.claim_next(t0(), lease()).unwrap().unwrap();

        running.mark_failed("store unavailable".to_string(), t0(), t0());
        store.update(&running).unwrap();

        let pending = store.pending_for(booking_id.into()).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending[0].status, JobStatus::Failed { .. }));
    }

    #[test]
    fn expired_lease_yields_to_a_replacement() {
        let store = InMemoryJobStore::new();
        let booking_id = BookingId::new();
        let original = store.enqueue(expire(booking_id, t0())).unwrap();
        store.claim_next(t0(), lease()).unwrap().unwrap();
        let replacement = store
            .enqueue(expire(booking_id, t0() + chrono::Duration::hours(1)))
            .unwrap();

        let later = t0() + chrono::Duration::minutes(6);
        assert_eq!(store.requeue_expired_leases(later).unwrap(), 1);

        let pending = store.pending_for(booking_id.into()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, replacement);
        assert!(matches!(store.get(original).unwrap().unwrap().status, JobStatus::Cancelled));
    }

    #[test]
    fn expired_leases_are_redelivered() {
        let store = InMemoryJobStore::new();
        let job_id = store.enqueue(expire(BookingId::new(), t0())).unwrap();
        store.claim_next(t0(), lease()).unwrap().unwrap();

        assert_eq!(store.requeue_expired_leases(t0() + chrono::Duration::minutes(1)).unwrap(), 0);

        let later = t0() + chrono::Duration::minutes(6);
        assert_eq!(store.requeue_expired_leases(later).unwrap(), 1);
        let again = store.claim_next(later, lease()).unwrap().unwrap();
        assert_eq!(again.id, job_id);
        assert_eq!(again.attempt, 2);
    }

    #[test]
    fn expired_lease_without_budget_is_dead_lettered() {
        let store = InMemoryJobStore::new();
        let job = expire(BookingId::new(), t0()).with_retry_policy(RetryPolicy::no_retry());
        let job_id = store.enqueue(job).unwrap();
        store.claim_next(t0(), lease()).unwrap().unwrap();

        store.requeue_expired_leases(t0() + chrono::Duration::hours(1)).unwrap();
        assert!(store.get(job_id).unwrap().is_none());
        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].reason, "lease expired");
    }

    #[test]
    fn dead_letter_flow() {
        let store = InMemoryJobStore::new();
        let job = expire(BookingId::new(), t0());
        let job_id = job.id;
        store.enqueue(job).unwrap();

        let mut claimed = store.claim_next(t0(), lease()).unwrap().unwrap();
        claimed.mark_dropped("booking not found".to_string(), t0(), t0());

        store
            .dead_letter(claimed, "booking not found".to_string(), t0())
            .unwrap();

        // Job is no longer in main queue
        assert!(store.get(job_id).unwrap().is_none());

        // Job is in DLQ
        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].job.id, job_id);

        // Retry the job
        let retried = store.retry_dead_letter(job_id, t0()).unwrap();
        assert!(matches!(retried.status, JobStatus::Pending));
        assert_eq!(retried.attempt, 0);

        // DLQ is now empty
        assert!(store.list_dead_letters(10).unwrap().is_empty());
        assert!(matches!(
            store.delete_dead_letter(job_id),
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[test]
    fn upcoming_lists_pending_by_trigger() {
        let store = InMemoryJobStore::new();
        let lesson_id = LessonId::new();
        store
            .enqueue(ScheduledJob::new(
                JobAction::StartLesson {
                    lesson_id,
                    scheduled_at: t0(),
                },
                t0() + chrono::Duration::hours(2),
                t0(),
            ))
            .unwrap();
        store
            .enqueue(expire(BookingId::new(), t0() + chrono::Duration::hours(1)))
            .unwrap();

        let upcoming = store.upcoming(10).unwrap();
        assert_eq!(upcoming.len(), 2);
        assert_eq!(upcoming[0].action_key, "booking.expire");
        assert_eq!(upcoming[1].subject_kind, SubjectKind::Lesson);
        assert_eq!(store.upcoming(1).unwrap().len(), 1);
    }

    #[test]
    fn purge_finished_keeps_pending() {
        let store = InMemoryJobStore::new();
        store.enqueue(expire(BookingId::new(), t0())).unwrap();
        let mut done = store.claim_next(t0(), lease()).unwrap().unwrap();
        done.mark_completed(t0(), t0());
        store.update(&done).unwrap();
        store
            .enqueue(expire(BookingId::new(), t0() + chrono::Duration::days(1)))
            .unwrap();

        assert_eq!(store.purge_finished(t0() + chrono::Duration::hours(1)).unwrap(), 1);
        assert_eq!(store.stats().unwrap().pending, 1);
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();

        for _ in 0..5 {
            store.enqueue(expire(BookingId::new(), t0())).unwrap();
        }

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 5);

        store.claim_next(t0(), lease()).unwrap();
        store.claim_next(t0(), lease()).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 2);
    }
}
