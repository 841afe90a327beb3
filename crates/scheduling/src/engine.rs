//! Runtime wiring: executor workers, the sweep and housekeeping on their
//! configured intervals.

use std::convert::Infallible;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, warn};

use lessonflow_booking::{BookingEvent, ReminderPlanner};
use lessonflow_core::SharedClock;
use lessonflow_infra::jobs::{
    InMemoryJobStore, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler,
    JobStore, JobStoreError,
};
use lessonflow_infra::workers::{PeriodicWorker, WorkerHandle};
use lessonflow_infra::{EntityStore, NotificationDispatcher};

use crate::config::SchedulingConfig;
use crate::lifecycle::LifecycleScheduler;
use crate::notifications::NotificationScheduler;
use crate::orchestrator::SchedulingOrchestrator;
use crate::processor::JobProcessor;
use crate::status::EngineStatus;
use crate::sweep::{ReconciliationSweep, SweepReport};
use crate::transitions::Transitions;

const EXECUTOR_NAME: &str = "lessonflow-executor";
const DEAD_LETTER_STATUS_LIMIT: usize = 50;

/// The assembled scheduling engine.
pub struct SchedulingEngine {
    config: SchedulingConfig,
    jobs: Arc<dyn JobStore>,
    orchestrator: SchedulingOrchestrator,
    sweep: ReconciliationSweep,
    processor: Arc<JobProcessor>,
    executor: JobExecutor<Arc<dyn JobStore>>,
    clock: SharedClock,
    last_sweep: Arc<Mutex<Option<SweepReport>>>,
}

impl SchedulingEngine {
    pub fn new(
        config: SchedulingConfig,
        store: EntityStore,
        jobs: Arc<dyn JobStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: SharedClock,
    ) -> Self {
        let lifecycle = LifecycleScheduler::new(jobs.clone(), config.lifecycle.clone(), config.retry.clone());
        let notifications = NotificationScheduler::new(
            jobs.clone(),
            ReminderPlanner::new(config.reminders.clone()),
            config.retry.clone(),
        );
        let orchestrator =
            SchedulingOrchestrator::new(Transitions::new(store), lifecycle, notifications, clock.clone());
        let sweep = ReconciliationSweep::new(orchestrator.clone(), config.sweep.clone());
        let processor = Arc::new(JobProcessor::new(orchestrator.clone(), dispatcher, clock.clone()));
        let executor = JobExecutor::new(
            jobs.clone(),
            processor.clone() as Arc<dyn JobHandler>,
            clock.clone(),
            executor_config(&config),
        );

        Self {
            config,
            jobs,
            orchestrator,
            sweep,
            processor,
            executor,
            clock,
            last_sweep: Arc::new(Mutex::new(None)),
        }
    }

    /// Engine over in-memory adapters, with the configured lock timeout.
    pub fn in_memory(
        config: SchedulingConfig,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: SharedClock,
    ) -> Self {
        let lock_timeout = config.executor.lock_timeout();
        Self::new(
            config,
            EntityStore::in_memory_with_lock_timeout(lock_timeout),
            Arc::new(InMemoryJobStore::with_lock_timeout(lock_timeout)),
            dispatcher,
            clock,
        )
    }

    pub fn config(&self) -> &SchedulingConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &SchedulingOrchestrator {
        &self.orchestrator
    }

    pub fn sweep(&self) -> &ReconciliationSweep {
        &self.sweep
    }

    pub fn store(&self) -> &EntityStore {
        self.orchestrator.transitions().store()
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    /// Forward a committed domain event to the orchestrator.
    pub fn handle(&self, event: &BookingEvent) {
        self.orchestrator.handle(event);
    }

    /// Redeliver abandoned jobs, then execute everything due at the clock's
    /// current time on the calling thread.
    pub fn run_due(&self) -> Result<usize, JobStoreError> {
        let requeued = self.jobs.requeue_expired_leases(self.clock.now())?;
        if requeued > 0 {
            warn!(requeued, "requeued jobs with expired leases");
        }
        self.executor.run_due()
    }

    /// Run one reconciliation sweep at the clock's current time.
    pub fn run_sweep(&self) -> SweepReport {
        run_sweep(&self.sweep, &self.last_sweep)
    }

    pub fn status(&self, upcoming_limit: usize) -> Result<EngineStatus, JobStoreError> {
        Ok(EngineStatus {
            jobs: self.jobs.stats()?,
            upcoming: self.jobs.upcoming(upcoming_limit)?,
            dead_letters: self.jobs.list_dead_letters(DEAD_LETTER_STATUS_LIMIT)?,
            executor: self.executor.stats(),
            last_sweep: self
                .last_sweep
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        })
    }

    /// Spawn executor workers plus the sweep, lease reaper and status
    /// reporter on their configured intervals.
    pub fn start(&self) -> io::Result<EngineHandle> {
        let intervals = &self.config.intervals;
        let executor = JobExecutor::new(
            self.jobs.clone(),
            self.processor.clone() as Arc<dyn JobHandler>,
            self.clock.clone(),
            executor_config(&self.config),
        )
        .with_shared_stats(self.executor.shared_stats())
        .spawn()?;
        let mut handle = EngineHandle {
            executor: Some(executor),
            workers: Vec::new(),
        };

        let sweep = self.sweep.clone();
        let last_sweep = self.last_sweep.clone();
        let spawned = PeriodicWorker::spawn("lessonflow-sweep", intervals.sweep(), move || {
            run_sweep(&sweep, &last_sweep);
            Ok::<(), Infallible>(())
        });
        handle.push(spawned)?;

        let jobs = self.jobs.clone();
        let clock = self.clock.clone();
        let spawned = PeriodicWorker::spawn("lessonflow-lease-reaper", intervals.lease_reaper(), move || {
            let requeued = jobs.requeue_expired_leases(clock.now())?;
            if requeued > 0 {
                warn!(requeued, "requeued jobs with expired leases");
            }
            Ok::<(), JobStoreError>(())
        });
        handle.push(spawned)?;

        let jobs = self.jobs.clone();
        let clock = self.clock.clone();
        let retain = self.config.executor.retain_finished();
        let spawned = PeriodicWorker::spawn("lessonflow-status", intervals.status_report(), move || {
            let purged = jobs.purge_finished(clock.now() - retain)?;
            let stats = jobs.stats()?;
            let next = jobs.upcoming(1)?;
            info!(
                pending = stats.pending,
                running = stats.running,
                failed = stats.failed,
                dead_lettered = stats.dead_lettered,
                purged,
                next_trigger = ?next.first().map(|t| t.trigger_at),
                "job queue status"
            );
            Ok::<(), JobStoreError>(())
        });
        handle.push(spawned)?;

        info!(
            workers = self.config.executor.workers,
            sweep_secs = intervals.sweep_secs,
            "scheduling engine started"
        );
        Ok(handle)
    }
}

impl std::fmt::Debug for SchedulingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle to the engine's background threads.
#[derive(Debug)]
pub struct EngineHandle {
    executor: Option<JobExecutorHandle>,
    workers: Vec<WorkerHandle>,
}

impl EngineHandle {
    /// Keep a freshly spawned worker, or stop everything started so far.
    fn push(&mut self, spawned: io::Result<WorkerHandle>) -> io::Result<()> {
        match spawned {
            Ok(worker) => {
                self.workers.push(worker);
                Ok(())
            }
            Err(err) => {
                self.stop();
                Err(err)
            }
        }
    }

    /// Stop periodic workers first, then drain the executor.
    pub fn shutdown(mut self) {
        self.stop();
        info!("scheduling engine stopped");
    }

    fn stop(&mut self) {
        for worker in self.workers.drain(..) {
            worker.shutdown();
        }
        if let Some(executor) = self.executor.take() {
            executor.shutdown();
        }
    }
}

fn run_sweep(sweep: &ReconciliationSweep, last: &Mutex<Option<SweepReport>>) -> SweepReport {
    let report = sweep.run();
    *last.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
    report
}

fn executor_config(config: &SchedulingConfig) -> JobExecutorConfig {
    JobExecutorConfig {
        poll_interval: config.intervals.poll(),
        workers: config.executor.workers.max(1),
        name: EXECUTOR_NAME.to_string(),
        job_timeout: config.executor.job_timeout(),
        lease: config.intervals.lease(),
    }
}
