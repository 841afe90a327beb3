//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lessonflow_booking::{Audience, BookingState, Channel};
use lessonflow_core::{BookingId, LessonId};

/// Prefix shared by every reminder action key.
pub const REMINDER_PREFIX: &str = "reminder.";

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity a job is keyed to, for cancellation and uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub Uuid);

impl From<BookingId> for SubjectId {
    fn from(id: BookingId) -> Self {
        Self(id.into())
    }
}

impl From<LessonId> for SubjectId {
    fn from(id: LessonId) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of subject a job targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Booking,
    Lesson,
    Notification,
}

/// Criticality class; selects the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    /// State-changing transitions (expire, confirm, lesson create/start/complete).
    Critical,
    /// Fallback checks (no-show).
    Check,
    /// Reminder delivery.
    Reminder,
}

/// Payload of a reminder job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderJob {
    pub booking_id: BookingId,
    pub audience: Audience,
    pub channel: Channel,
    pub template_key: String,
    pub send_at: DateTime<Utc>,
    /// Booking state the reminder is only valid in.
    pub expects: BookingState,
    /// Booking `scheduled_at` at planning time.
    pub anchor: DateTime<Utc>,
}

/// Closed set of delayed actions. Time-anchored variants carry the
/// `scheduled_at` they were planned against so handlers can detect jobs that
/// predate a reschedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum JobAction {
    ExpireBooking {
        booking_id: BookingId,
    },
    AutoConfirmBooking {
        booking_id: BookingId,
    },
    NoShowCheck {
        booking_id: BookingId,
        scheduled_at: DateTime<Utc>,
    },
    CreateLesson {
        booking_id: BookingId,
        scheduled_at: DateTime<Utc>,
    },
    StartLesson {
        lesson_id: LessonId,
        scheduled_at: DateTime<Utc>,
    },
    CompleteLesson {
        lesson_id: LessonId,
        scheduled_at: DateTime<Utc>,
    },
    SendReminder(ReminderJob),
}

impl JobAction {
    pub fn subject_id(&self) -> SubjectId {
        match self {
            JobAction::ExpireBooking { booking_id }
            | JobAction::AutoConfirmBooking { booking_id }
            | JobAction::NoShowCheck { booking_id, .. }
            | JobAction::CreateLesson { booking_id, .. } => (*booking_id).into(),
            JobAction::StartLesson { lesson_id, .. } | JobAction::CompleteLesson { lesson_id, .. } => {
                (*lesson_id).into()
            }
            JobAction::SendReminder(r) => r.booking_id.into(),
        }
    }

    pub fn subject_kind(&self) -> SubjectKind {
        match self {
            JobAction::ExpireBooking { .. }
            | JobAction::AutoConfirmBooking { .. }
            | JobAction::NoShowCheck { .. }
            | JobAction::CreateLesson { .. } => SubjectKind::Booking,
            JobAction::StartLesson { .. } | JobAction::CompleteLesson { .. } => SubjectKind::Lesson,
            JobAction::SendReminder(_) => SubjectKind::Notification,
        }
    }

    /// Key used for uniqueness and prefix cancellation. At most one pending
    /// job exists per `(subject_id, action_key)`.
    pub fn action_key(&self) -> String {
        match self {
            JobAction::ExpireBooking { .. } => "booking.expire".to_string(),
            JobAction::AutoConfirmBooking { .. } => "booking.auto_confirm".to_string(),
            JobAction::NoShowCheck { .. } => "booking.no_show_check".to_string(),
            JobAction::CreateLesson { .. } => "lesson.create".to_string(),
            JobAction::StartLesson { .. } => "lesson.start".to_string(),
            JobAction::CompleteLesson { .. } => "lesson.complete".to_string(),
            JobAction::SendReminder(r) => format!(
                "{REMINDER_PREFIX}{}.{}.{:?}@{}",
                r.template_key,
                r.audience.as_str(),
                r.channel,
                r.send_at.timestamp()
            ),
        }
    }

    pub fn class(&self) -> ActionClass {
        match self {
            JobAction::ExpireBooking { .. }
            | JobAction::AutoConfirmBooking { .. }
            | JobAction::CreateLesson { .. }
            | JobAction::StartLesson { .. }
            | JobAction::CompleteLesson { .. } => ActionClass::Critical,
            JobAction::NoShowCheck { .. } => ActionClass::Check,
            JobAction::SendReminder(_) => ActionClass::Reminder,
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for its trigger time
    Pending,
    /// Claimed by a worker
    Running,
    /// Completed successfully
    Completed,
    /// Ran, but the subject no longer matched the job's precondition
    Skipped { reason: String },
    /// Failed, will be retried
    Failed { error: String, attempt: u32 },
    /// Exhausted retries or failed permanently, moved to DLQ
    DeadLettered { error: String, attempts: u32 },
    /// Cancelled before execution
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Skipped { .. }
                | JobStatus::DeadLettered { .. }
                | JobStatus::Cancelled
        )
    }

    /// Waiting to run (first attempt or retry). Only these can be cancelled.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed { .. })
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed (1 = run once, never retry)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to add randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * (attempt as f64)).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A delayed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Unique job ID
    pub id: JobId,
    /// Entity the job is keyed to
    pub subject_id: SubjectId,
    pub subject_kind: SubjectKind,
    /// Typed payload
    pub action: JobAction,
    /// Current status
    pub status: JobStatus,
    /// Retry policy
    pub retry_policy: RetryPolicy,
    /// Current attempt number (starts at 0)
    pub attempt: u32,
    /// When the job becomes due (pushed back by retry backoff)
    pub trigger_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set while `Running`; an expired lease makes the job deliverable again
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Execution history (one record per attempt)
    pub history: Vec<JobAttemptRecord>,
    /// Free-form context for operators (origin event, planner, ...)
    pub metadata: serde_json::Value,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ScheduledJob {
    /// Create a new job due at `trigger_at`.
    pub fn new(action: JobAction, trigger_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            subject_id: action.subject_id(),
            subject_kind: action.subject_kind(),
            action,
            status: JobStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            trigger_at,
            created_at: now,
            updated_at: now,
            lease_expires_at: None,
            history: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Set a custom retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn action_key(&self) -> String {
        self.action.action_key()
    }

    /// Check if the job is due.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_pending() && now >= self.trigger_at
    }

    /// Mark job as running under a lease.
    pub fn mark_running(&mut self, now: DateTime<Utc>, lease: chrono::Duration) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.updated_at = now;
        self.lease_expires_at = Some(now + lease);
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.finish(started_at, now, None);
    }

    /// Mark job as a no-op: its precondition no longer held.
    pub fn mark_skipped(&mut self, reason: String, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = JobStatus::Skipped { reason };
        self.finish(started_at, now, None);
    }

    /// Mark job as failed transiently; retries with backoff while the budget lasts.
    pub fn mark_failed(&mut self, error: String, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.finish(started_at, now, Some(error.clone()));

        if self.retry_policy.should_retry(self.attempt) {
            let delay = self.retry_policy.delay_for_attempt(self.attempt);
            self.trigger_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            self.status = JobStatus::Failed {
                error,
                attempt: self.attempt,
            };
        } else {
            self.status = JobStatus::DeadLettered {
                error,
                attempts: self.attempt,
            };
        }
    }

    /// Mark job as permanently failed: no retry regardless of budget.
    pub fn mark_dropped(&mut self, error: String, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.finish(started_at, now, Some(error.clone()));
        self.status = JobStatus::DeadLettered {
            error,
            attempts: self.attempt,
        };
    }

    /// Mark job as cancelled.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.updated_at = now;
        self.lease_expires_at = None;
    }

    fn finish(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>, error: Option<String>) {
        self.updated_at = now;
        self.lease_expires_at = None;
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            success: error.is_none(),
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Reference to an enqueued job, returned by planners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub subject_id: SubjectId,
    pub action_key: String,
    pub trigger_at: DateTime<Utc>,
}

impl From<&ScheduledJob> for JobHandle {
    fn from(job: &ScheduledJob) -> Self {
        Self {
            job_id: job.id,
            subject_id: job.subject_id,
            action_key: job.action_key(),
            trigger_at: job.trigger_at,
        }
    }
}

/// Result of job execution, as reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Precondition mismatch; a silent no-op, never retried
    Skipped(String),
    /// Transient failure; retried per the job's policy
    Retry(String),
    /// Permanent failure; dropped without retry
    Drop(String),
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: ScheduledJob,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: ScheduledJob, reason: String, now: DateTime<Utc>) -> Self {
        Self {
            job,
            dead_lettered_at: now,
            reason,
        }
    }
}
