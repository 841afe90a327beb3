//! Bookings and lessons domain module.
//!
//! This crate contains business rules for the booking and lesson lifecycles and
//! reminder planning, implemented purely as deterministic domain logic (no IO,
//! no storage, no scheduling).

pub mod booking;
pub mod event;
pub mod lesson;
pub mod reminder;

pub use booking::{Booking, BookingState, BookingTransition, CancellationReason, NewBooking};
pub use event::{BookingEvent, Event};
pub use lesson::{Lesson, LessonState, LessonTransition};
pub use reminder::{
    Audience, Channel, ReminderOffset, ReminderPlanner, ReminderPolicy, ReminderSpec,
    ReminderTrigger,
};
