//! Delayed job queue with leases, retry/backoff and dead-letter handling.
//!
//! ## Design
//!
//! - Jobs carry a typed [`JobAction`] and fire at a trigger time
//! - At most one pending job per `(subject_id, action_key)`
//! - At-least-once delivery: claimed jobs are leased, expired leases redeliver
//! - Retry policy with exponential backoff, per action class
//! - Dead-letter queue for jobs that exhausted retries or failed permanently
//!
//! ## Components
//!
//! - `ScheduledJob`: job record with status, attempt history and metadata
//! - `JobStore`: persistence for jobs (in-memory here; durable stores plug in)
//! - `JobExecutor`: claims due jobs and runs them through a `JobHandler`

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{
    ExecutionOutcome, ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler,
};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, UpcomingTrigger};
pub use types::{
    ActionClass, BackoffStrategy, DeadLetterEntry, JobAction, JobAttemptRecord, JobHandle, JobId,
    JobResult, JobStatus, REMINDER_PREFIX, ReminderJob, RetryPolicy, ScheduledJob, SubjectId,
    SubjectKind,
};
