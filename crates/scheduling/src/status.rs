//! Operational status surface.

use serde::Serialize;

use lessonflow_infra::jobs::{DeadLetterEntry, ExecutorStats, JobStats, UpcomingTrigger};

use crate::sweep::SweepReport;

/// Snapshot of queue health for ops tooling and tests.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub jobs: JobStats,
    /// Next pending triggers, earliest first.
    pub upcoming: Vec<UpcomingTrigger>,
    pub dead_letters: Vec<DeadLetterEntry>,
    pub executor: ExecutorStats,
    pub last_sweep: Option<SweepReport>,
}

impl EngineStatus {
    /// Whether anything needs an operator's attention.
    pub fn is_degraded(&self) -> bool {
        !self.dead_letters.is_empty() || self.last_sweep.as_ref().is_some_and(|s| s.errors > 0)
    }
}
