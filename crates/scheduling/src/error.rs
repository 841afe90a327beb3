//! Scheduling error taxonomy.

use lessonflow_core::DomainError;
use lessonflow_infra::jobs::{JobResult, JobStoreError};
use lessonflow_infra::{DispatchError, StoreError};

pub type SchedulingResult<T> = Result<T, SchedulingError>;

/// How a scheduling operation failed, which decides what happens to the job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulingError {
    /// The entity no longer matches what the job assumed. Silent no-op.
    #[error("precondition mismatch: {0}")]
    PreconditionMismatch(String),
    /// Store, queue or dispatcher temporarily unavailable. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Malformed payload or missing entity. Dropped without retry.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl SchedulingError {
    pub fn mismatch(msg: impl Into<String>) -> Self {
        Self::PreconditionMismatch(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_mismatch(&self) -> bool {
        matches!(self, SchedulingError::PreconditionMismatch(_))
    }

    /// What the executor should do with a job that failed this way.
    pub fn into_job_result(self) -> JobResult {
        match self {
            SchedulingError::PreconditionMismatch(reason) => JobResult::Skipped(reason),
            SchedulingError::Transient(error) => JobResult::Retry(error),
            SchedulingError::Validation(error) => JobResult::Drop(error),
        }
    }
}

impl From<DomainError> for SchedulingError {
    fn from(err: DomainError) -> Self {
        // A rejected transition or a lost uniqueness race means the entity
        // moved on underneath the job.
        if err.is_state_mismatch() {
            SchedulingError::PreconditionMismatch(err.to_string())
        } else {
            SchedulingError::Validation(err.to_string())
        }
    }
}

impl From<StoreError> for SchedulingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => SchedulingError::Transient(msg),
            StoreError::Conflict(msg) => SchedulingError::PreconditionMismatch(msg),
            StoreError::Domain(err) => err.into(),
        }
    }
}

impl From<JobStoreError> for SchedulingError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::Duplicate { .. } => SchedulingError::PreconditionMismatch(err.to_string()),
            JobStoreError::NotFound(_)
            | JobStoreError::AlreadyExists(_)
            | JobStoreError::Unavailable(_)
            | JobStoreError::Storage(_) => SchedulingError::Transient(err.to_string()),
        }
    }
}

impl From<DispatchError> for SchedulingError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Unavailable(msg) => SchedulingError::Transient(msg),
            DispatchError::Rejected(msg) => SchedulingError::Validation(msg),
        }
    }
}
