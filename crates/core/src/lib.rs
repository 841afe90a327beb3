//! `lessonflow-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model, the clock capability and the lifecycle
//! traits every stateful entity implements.

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod lifecycle;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{BookingId, LessonId, UserId};
pub use lifecycle::Lifecycle;
