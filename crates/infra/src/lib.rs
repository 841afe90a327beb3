//! Infrastructure layer: job queue, entity repositories, notification
//! dispatch and background workers.

pub mod dispatch;
pub mod jobs;
pub mod lock;
pub mod store;
pub mod workers;

pub use dispatch::{
    DispatchError, NotificationDispatcher, OutboundNotification, RecordingDispatcher,
    TracingDispatcher,
};
pub use store::{CasOutcome, EntityStore, InMemoryRepository, Repository, StoreError};
