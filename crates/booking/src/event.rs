//! Domain events published by the booking/lesson CRUD layer after it commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lessonflow_core::{BookingId, LessonId};

/// A domain-agnostic event.
///
/// Events are immutable facts; the scheduling engine reacts to them but never
/// emits them.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "booking.confirmed").
    fn event_type(&self) -> &'static str;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Lifecycle facts about bookings and lessons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingEvent {
    Created {
        booking_id: BookingId,
        occurred_at: DateTime<Utc>,
    },
    Confirmed {
        booking_id: BookingId,
        occurred_at: DateTime<Utc>,
    },
    Cancelled {
        booking_id: BookingId,
        occurred_at: DateTime<Utc>,
    },
    Rescheduled {
        booking_id: BookingId,
        previous_scheduled_at: DateTime<Utc>,
        occurred_at: DateTime<Utc>,
    },
    LessonCompleted {
        lesson_id: LessonId,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for BookingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BookingEvent::Created { .. } => "booking.created",
            BookingEvent::Confirmed { .. } => "booking.confirmed",
            BookingEvent::Cancelled { .. } => "booking.cancelled",
            BookingEvent::Rescheduled { .. } => "booking.rescheduled",
            BookingEvent::LessonCompleted { .. } => "lesson.completed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BookingEvent::Created { occurred_at, .. }
            | BookingEvent::Confirmed { occurred_at, .. }
            | BookingEvent::Cancelled { occurred_at, .. }
            | BookingEvent::Rescheduled { occurred_at, .. }
            | BookingEvent::LessonCompleted { occurred_at, .. } => *occurred_at,
        }
    }
}
