//! Job executor with retry and backoff logic.

use std::io;
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use lessonflow_core::SharedClock;

use super::store::{JobStore, JobStoreError};
use super::types::{JobResult, JobStatus, ScheduledJob};

/// Executes one claimed job.
///
/// Handlers must be idempotent: delivery is at-least-once, so a job may run
/// again after a crash or an expired lease.
pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &ScheduledJob) -> JobResult;
}

impl<F> JobHandler for F
where
    F: Fn(&ScheduledJob) -> JobResult + Send + Sync,
{
    fn handle(&self, job: &ScheduledJob) -> JobResult {
        self(job)
    }
}

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often idle workers poll for due jobs
    pub poll_interval: Duration,
    /// Number of worker threads
    pub workers: usize,
    /// Name for logging and thread names
    pub name: String,
    /// Upper bound on one handler invocation
    pub job_timeout: Duration,
    /// How long a claimed job stays invisible to other workers
    pub lease: Duration,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            workers: 2,
            name: "job-executor".to_string(),
            job_timeout: Duration::from_secs(30),
            lease: Duration::from_secs(120),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// How a single execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Skipped,
    Retrying,
    DeadLettered,
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_skipped: u64,
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: ExecutionOutcome) {
        self.jobs_processed += 1;
        match outcome {
            ExecutionOutcome::Succeeded => self.jobs_succeeded += 1,
            ExecutionOutcome::Skipped => self.jobs_skipped += 1,
            ExecutionOutcome::Retrying => self.jobs_failed += 1,
            ExecutionOutcome::DeadLettered => {
                self.jobs_failed += 1;
                self.jobs_dead_lettered += 1;
            }
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Request graceful shutdown and wait for every worker to stop.
    pub fn shutdown(self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for join in self.joins {
            let _ = join.join();
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Background job executor.
///
/// Claims due jobs from a store, runs them through a single handler under a
/// timeout, and applies the job's retry policy to the result.
pub struct JobExecutor<S: JobStore> {
    store: S,
    handler: Arc<dyn JobHandler>,
    clock: SharedClock,
    config: JobExecutorConfig,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl<S: JobStore + 'static> JobExecutor<S> {
    /// Create a new executor over `store`.
    pub fn new(
        store: S,
        handler: Arc<dyn JobHandler>,
        clock: SharedClock,
        config: JobExecutorConfig,
    ) -> Self {
        Self {
            store,
            handler,
            clock,
            config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Counters this executor records into.
    pub fn shared_stats(&self) -> Arc<Mutex<ExecutorStats>> {
        Arc::clone(&self.stats)
    }

    /// Record into `stats`, e.g. another executor's [`shared_stats`](Self::shared_stats).
    pub fn with_shared_stats(mut self, stats: Arc<Mutex<ExecutorStats>>) -> Self {
        self.stats = stats;
        self
    }

    fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.lease).unwrap_or_else(|_| chrono::Duration::minutes(2))
    }

    /// Claim and execute every job due at the clock's current time.
    ///
    /// Synchronous; used by tests and by callers that drive their own loop.
    /// Jobs that back off into the future are left for a later call.
    pub fn run_due(&self) -> Result<usize, JobStoreError> {
        let mut processed = 0;
        while let Some(mut job) = self.store.claim_next(self.clock.now(), self.lease())? {
            self.execute_one(&mut job)?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Execute a single claimed job and persist its outcome.
    pub fn execute_one(&self, job: &mut ScheduledJob) -> Result<ExecutionOutcome, JobStoreError> {
        let started = self.clock.now();
        let result = self.invoke(job);
        let now = self.clock.now();

        let outcome = match result {
            JobResult::Success => {
                job.mark_completed(started, now);
                self.store.update(job)?;
                debug!(job_id = %job.id, action = %job.action_key(), "job completed successfully");
                ExecutionOutcome::Succeeded
            }
            JobResult::Skipped(reason) => {
                debug!(job_id = %job.id, action = %job.action_key(), reason = %reason, "job skipped");
                job.mark_skipped(reason, started, now);
                self.store.update(job)?;
                ExecutionOutcome::Skipped
            }
            JobResult::Retry(error) => {
                job.mark_failed(error.clone(), started, now);
                if matches!(job.status, JobStatus::DeadLettered { .. }) {
                    warn!(
                        job_id = %job.id,
                        action = %job.action_key(),
                        attempts = job.attempt,
                        error = %error,
                        "job retries exhausted, dead-lettered"
                    );
                    self.store.dead_letter(job.clone(), error, now)?;
                    ExecutionOutcome::DeadLettered
                } else {
                    debug!(
                        job_id = %job.id,
                        action = %job.action_key(),
                        attempt = job.attempt,
                        retry_at = %job.trigger_at,
                        error = %error,
                        "job failed, will retry"
                    );
                    self.store.update(job)?;
                    ExecutionOutcome::Retrying
                }
            }
            JobResult::Drop(error) => {
                warn!(job_id = %job.id, action = %job.action_key(), error = %error, "job dropped");
                job.mark_dropped(error.clone(), started, now);
                self.store.dead_letter(job.clone(), error, now)?;
                ExecutionOutcome::DeadLettered
            }
        };

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(outcome);
        Ok(outcome)
    }

    /// Run the handler on its own thread, bounded by `job_timeout`.
    ///
    /// A handler that overruns keeps running detached; its job is reported
    /// as a transient failure and redelivered per the retry policy.
    fn invoke(&self, job: &ScheduledJob) -> JobResult {
        let (tx, rx) = mpsc::channel();
        let handler = Arc::clone(&self.handler);
        let payload = job.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-job", self.config.name))
            .spawn(move || {
                let _ = tx.send(handler.handle(&payload));
            });
        if let Err(e) = spawned {
            return JobResult::Retry(format!("failed to spawn job thread: {e}"));
        }

        match rx.recv_timeout(self.config.job_timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                JobResult::Retry(format!("timed out after {:?}", self.config.job_timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => JobResult::Retry("handler panicked".to_string()),
        }
    }

    /// Spawn `workers` background threads polling the store.
    pub fn spawn(self) -> io::Result<JobExecutorHandle>
    where
        S: Send + Sync,
    {
        let workers = self.config.workers.max(1);
        let stats = Arc::clone(&self.stats);
        let executor = Arc::new(self);

        let mut shutdown = Vec::with_capacity(workers);
        let mut joins = Vec::with_capacity(workers);

        for worker in 0..workers {
            let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
            let executor = Arc::clone(&executor);
            let join = thread::Builder::new()
                .name(format!("{}-{worker}", executor.config.name))
                .spawn(move || executor_loop(&executor, worker, shutdown_rx));

            match join {
                Ok(join) => {
                    shutdown.push(shutdown_tx);
                    joins.push(join);
                }
                Err(e) => {
                    // Stop whatever already started before reporting.
                    JobExecutorHandle {
                        shutdown,
                        joins,
                        stats,
                    }
                    .shutdown();
                    return Err(e);
                }
            }
        }

        Ok(JobExecutorHandle {
            shutdown,
            joins,
            stats,
        })
    }
}

fn executor_loop<S: JobStore + 'static>(
    executor: &JobExecutor<S>,
    worker: usize,
    shutdown_rx: mpsc::Receiver<()>,
) {
    let name = &executor.config.name;
    info!(executor = %name, worker, "job executor started");
    let start_time = Instant::now();

    loop {
        // Check for shutdown
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        executor
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .uptime_secs = start_time.elapsed().as_secs();

        match executor.store.claim_next(executor.clock.now(), executor.lease()) {
            Ok(Some(mut job)) => {
                debug!(
                    executor = %name,
                    worker,
                    job_id = %job.id,
                    action = %job.action_key(),
                    attempt = job.attempt,
                    "claimed job"
                );

                executor
                    .stats
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .current_running += 1;

                let result = executor.execute_one(&mut job);

                {
                    let mut s = executor.stats.lock().unwrap_or_else(PoisonError::into_inner);
                    s.current_running = s.current_running.saturating_sub(1);
                }

                if let Err(e) = result {
                    // The lease will expire and the job will be redelivered.
                    error!(executor = %name, job_id = %job.id, error = %e, "failed to record job outcome");
                }
            }
            Ok(None) => {
                // Nothing due; wait for the next poll or a shutdown request.
                if shutdown_rx.recv_timeout(executor.config.poll_interval).is_ok() {
                    break;
                }
            }
            Err(e) => {
                error!(executor = %name, error = %e, "failed to claim job");
                thread::sleep(executor.config.poll_interval);
            }
        }
    }

    info!(executor = %name, worker, "job executor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobAction, RetryPolicy};
    use chrono::{TimeZone, Utc};
    use lessonflow_core::{BookingId, Clock, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(
        handler: impl JobHandler + 'static,
    ) -> (Arc<InMemoryJobStore>, Arc<ManualClock>, JobExecutor<Arc<InMemoryJobStore>>) {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap());
        let config = JobExecutorConfig::default().with_job_timeout(Duration::from_secs(5));
        let executor = JobExecutor::new(store.clone(), Arc::new(handler), clock.clone(), config);
        (store, clock, executor)
    }

    fn job_at(clock: &ManualClock, policy: RetryPolicy) -> ScheduledJob {
        ScheduledJob::new(
            JobAction::ExpireBooking {
                booking_id: BookingId::new(),
            },
            clock.now(),
            clock.now(),
        )
        .with_retry_policy(policy)
    }

    #[test]
    fn execute_successful_job() {
        let (store, clock, executor) = setup(|_job: &ScheduledJob| JobResult::Success);
        let job_id = store.enqueue(job_at(&clock, RetryPolicy::default())).unwrap();

        assert_eq!(executor.run_due().unwrap(), 1);
        let job = store.get(job_id).unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Completed));
        assert_eq!(executor.stats().jobs_succeeded, 1);
    }

    #[test]
    fn jobs_not_yet_due_are_left_alone() {
        let (store, clock, executor) = setup(|_job: &ScheduledJob| JobResult::Success);
        let mut job = job_at(&clock, RetryPolicy::default());
        job.trigger_at = clock.now() + chrono::Duration::minutes(5);
        store.enqueue(job).unwrap();

        assert_eq!(executor.run_due().unwrap(), 0);
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(executor.run_due().unwrap(), 1);
    }

    #[test]
    fn skipped_jobs_are_not_retried() {
        let (store, clock, executor) =
            setup(|_job: &ScheduledJob| JobResult::Skipped("booking is cancelled".to_string()));
        let job_id = store.enqueue(job_at(&clock, RetryPolicy::default())).unwrap();

        executor.run_due().unwrap();
        clock.advance(chrono::Duration::hours(1));
        assert_eq!(executor.run_due().unwrap(), 0);

        let job = store.get(job_id).unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Skipped { ref reason } if reason == "booking is cancelled"));
        assert_eq!(executor.stats().jobs_skipped, 1);
    }

    #[test]
    fn execute_failing_job_with_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (store, clock, executor) = setup(move |_job: &ScheduledJob| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobResult::Retry("store unavailable".to_string())
        });
        let policy = RetryPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        let job_id = store.enqueue(job_at(&clock, policy)).unwrap();

        // First attempt backs off into the future.
        executor.run_due().unwrap();
        let job = store.get(job_id).unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Failed { attempt: 1, .. }));

        // Second attempt exhausts the budget.
        clock.advance(chrono::Duration::minutes(1));
        executor.run_due().unwrap();
        assert!(store.get(job_id).unwrap().is_none());
        assert_eq!(store.list_dead_letters(10).unwrap().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stats = executor.stats();
        assert_eq!(stats.jobs_failed, 2);
        assert_eq!(stats.jobs_dead_lettered, 1);
    }

    #[test]
    fn failing_handler_that_replanned_its_key_leaves_one_pending_job() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap());
        let replanner = store.clone();
        let handler = move |job: &ScheduledJob| {
            let later = job.trigger_at + chrono::Duration::hours(1);
            let _ = replanner.enqueue(ScheduledJob::new(job.action.clone(), later, job.trigger_at));
            JobResult::Retry("store unavailable".to_string())
        };
        let config = JobExecutorConfig::default().with_job_timeout(Duration::from_secs(5));
        let executor = JobExecutor::new(store.clone(), Arc::new(handler), clock.clone(), config);
        let job = job_at(&clock, RetryPolicy::default());
        let subject = job.subject_id;
        let original = store.enqueue(job).unwrap();

        assert_eq!(executor.run_due().unwrap(), 1);

        let pending = store.pending_for(subject).unwrap();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, original);
        assert!(matches!(store.get(original).unwrap().unwrap().status, JobStatus::Cancelled));
    }

    #[test]
    fn spawned_executor_can_report_into_shared_stats() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap());
        let sync = JobExecutor::new(
            store.clone(),
            Arc::new(|_job: &ScheduledJob| JobResult::Success),
            clock.clone(),
            JobExecutorConfig::default(),
        );
        let config = JobExecutorConfig {
            poll_interval: Duration::from_millis(5),
            ..JobExecutorConfig::default()
        };
        store.enqueue(job_at(&clock, RetryPolicy::default())).unwrap();

        let handle = JobExecutor::new(
            store.clone(),
            Arc::new(|_job: &ScheduledJob| JobResult::Success),
            clock,
            config,
        )
        .with_shared_stats(sync.shared_stats())
        .spawn()
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sync.stats().jobs_processed < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        assert_eq!(sync.stats().jobs_succeeded, 1);
    }

    #[test]
    fn dropped_job_goes_straight_to_dead_letters() {
        let (store, clock, executor) =
            setup(|_job: &ScheduledJob| JobResult::Drop("booking not found".to_string()));
        store.enqueue(job_at(&clock, RetryPolicy::default())).unwrap();

        executor.run_due().unwrap();
        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].reason, "booking not found");
        assert_eq!(dls[0].job.attempt, 1);
    }

    #[test]
    fn slow_handler_times_out_as_transient_failure() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap());
        let config = JobExecutorConfig::default().with_job_timeout(Duration::from_millis(20));
        let handler = |_job: &ScheduledJob| {
            thread::sleep(Duration::from_millis(500));
            JobResult::Success
        };
        let executor = JobExecutor::new(store.clone(), Arc::new(handler), clock.clone(), config);
        let job_id = store.enqueue(job_at(&clock, RetryPolicy::default())).unwrap();

        executor.run_due().unwrap();
        let job = store.get(job_id).unwrap().unwrap();
        assert!(matches!(job.status, JobStatus::Failed { ref error, .. } if error.starts_with("timed out")));
    }

    #[test]
    fn spawned_workers_drain_queue_and_shut_down() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap());
        let config = JobExecutorConfig {
            poll_interval: Duration::from_millis(5),
            ..JobExecutorConfig::default()
        }
        .with_workers(3);
        let handler = move |_job: &ScheduledJob| {
            counter.fetch_add(1, Ordering::SeqCst);
            JobResult::Success
        };
        for _ in 0..10 {
            store.enqueue(job_at(&clock, RetryPolicy::default())).unwrap();
        }

        let handle = JobExecutor::new(store.clone(), Arc::new(handler), clock, config)
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().jobs_processed < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.jobs_succeeded, 10);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(store.stats().unwrap().completed, 10);
    }
}
