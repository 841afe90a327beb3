//! `lessonflow-scheduling`: delayed job scheduling and lifecycle
//! reconciliation for bookings and lessons.
//!
//! - [`LifecycleScheduler`] plans the next timed transition of an entity
//! - [`NotificationScheduler`] plans and cancels reminder jobs
//! - [`JobProcessor`] executes due jobs through guarded [`Transitions`]
//! - [`ReconciliationSweep`] repairs whatever the job path missed
//! - [`SchedulingOrchestrator`] reacts to committed domain events
//! - [`SchedulingEngine`] wires them to the job executor and periodic workers

pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod notifications;
pub mod orchestrator;
pub mod processor;
pub mod status;
pub mod sweep;
pub mod transitions;

pub use config::{ConfigError, SchedulingConfig};
pub use engine::{EngineHandle, SchedulingEngine};
pub use error::{SchedulingError, SchedulingResult};
pub use lifecycle::{LifecycleScheduler, LifecycleSubject};
pub use notifications::NotificationScheduler;
pub use orchestrator::SchedulingOrchestrator;
pub use processor::JobProcessor;
pub use status::EngineStatus;
pub use sweep::{ReconciliationSweep, SweepReport};
pub use transitions::Transitions;
