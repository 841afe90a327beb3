//! Guarded entity mutations shared by the job path and the sweep.
//!
//! Every method re-reads the entity, checks the precondition the caller
//! planned against and applies exactly one compare-and-transition. A
//! precondition that no longer holds is reported as
//! [`SchedulingError::PreconditionMismatch`]; follow-up planning is the
//! caller's business.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use lessonflow_booking::{
    Booking, BookingState, BookingTransition, Lesson, LessonState, LessonTransition,
};
use lessonflow_core::{BookingId, DomainError, DomainResult, Entity, LessonId};
use lessonflow_infra::{CasOutcome, EntityStore};

use crate::error::{SchedulingError, SchedulingResult};

#[derive(Debug, Clone)]
pub struct Transitions {
    store: EntityStore,
}

impl Transitions {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn booking(&self, booking_id: BookingId) -> SchedulingResult<Booking> {
        self.store
            .bookings
            .get(&booking_id)?
            .ok_or_else(|| SchedulingError::validation(format!("booking {booking_id} not found")))
    }

    pub fn lesson(&self, lesson_id: LessonId) -> SchedulingResult<Lesson> {
        self.store
            .lessons
            .get(&lesson_id)?
            .ok_or_else(|| SchedulingError::validation(format!("lesson {lesson_id} not found")))
    }

    /// The booking's lesson, ignoring one that was cancelled.
    pub fn live_lesson_for(&self, booking_id: BookingId) -> SchedulingResult<Option<Lesson>> {
        Ok(self
            .store
            .lesson_for_booking(booking_id)?
            .filter(|l| l.state() != LessonState::Cancelled))
    }

    /// `Pending → Cancelled(Expired)`.
    pub fn expire_booking(&self, booking_id: BookingId, now: DateTime<Utc>) -> SchedulingResult<Booking> {
        let outcome = self.store.bookings.compare_and_transition(
            &booking_id,
            BookingState::Pending,
            &|b: &mut Booking| b.apply(BookingTransition::Expire, now),
        )?;
        let booking = settle(outcome, "expire", booking_id)?;
        info!(booking_id = %booking_id, "booking expired");
        Ok(booking)
    }

    /// `Pending → Confirmed`, only for bookings whose tutor accepts instant confirmation.
    pub fn auto_confirm_booking(&self, booking_id: BookingId, now: DateTime<Utc>) -> SchedulingResult<Booking> {
        let outcome = self.store.bookings.compare_and_transition(
            &booking_id,
            BookingState::Pending,
            &|b: &mut Booking| {
                if !b.instant_confirm() {
                    return Err(DomainError::conflict("instant confirmation is disabled"));
                }
                b.apply(BookingTransition::Confirm, now)
            },
        )?;
        let booking = settle(outcome, "auto-confirm", booking_id)?;
        info!(booking_id = %booking_id, "booking auto-confirmed");
        Ok(booking)
    }

    /// `Confirmed → Cancelled(NoShow)` when no lesson was ever materialised.
    pub fn no_show(
        &self,
        booking_id: BookingId,
        anchor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<Booking> {
        if let Some(lesson) = self.live_lesson_for(booking_id)? {
            return Err(SchedulingError::mismatch(format!(
                "booking {booking_id} has lesson {} ({:?})",
                lesson.id_typed(),
                lesson.state()
            )));
        }
        let outcome = self.store.bookings.compare_and_transition(
            &booking_id,
            BookingState::Confirmed,
            &|b: &mut Booking| {
                check_anchor(b.scheduled_at(), anchor)?;
                b.apply(BookingTransition::NoShow, now)
            },
        )?;
        let booking = settle(outcome, "no-show", booking_id)?;
        info!(booking_id = %booking_id, "booking marked no-show");

        // A lesson inserted between the check above and the write is
        // cancelled with its booking; the orphan sweep catches any that fail.
        if let Some(lesson) = self.live_lesson_for(booking_id)? {
            if let Err(err) = self.cancel_lesson(lesson.id_typed(), now) {
                warn!(
                    booking_id = %booking_id,
                    lesson_id = %lesson.id_typed(),
                    error = %err,
                    "could not cancel lesson of a no-show booking"
                );
            }
        }
        Ok(booking)
    }

    /// Materialise the lesson for a confirmed booking.
    ///
    /// A booking that left `Confirmed` while the lesson was being inserted
    /// gets the new lesson cancelled again; one that moved gets it moved too.
    pub fn create_lesson(
        &self,
        booking_id: BookingId,
        anchor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<Lesson> {
        let booking = self.booking(booking_id)?;
        if booking.state() != BookingState::Confirmed {
            return Err(SchedulingError::mismatch(format!(
                "booking {booking_id} is {:?}",
                booking.state()
            )));
        }
        check_anchor(booking.scheduled_at(), anchor)?;
        if let Some(existing) = self.store.lesson_for_booking(booking_id)? {
            return Err(SchedulingError::mismatch(format!(
                "booking {booking_id} already has lesson {}",
                existing.id_typed()
            )));
        }

        let lesson = Lesson::from_booking(LessonId::new(), &booking, now)?;
        let lesson_id = lesson.id_typed();
        self.store.lessons.insert(lesson.clone())?;

        let current = self.booking(booking_id)?;
        if current.state() != BookingState::Confirmed {
            self.cancel_lesson(lesson_id, now)?;
            return Err(SchedulingError::mismatch(format!(
                "booking {booking_id} became {:?} during lesson creation",
                current.state()
            )));
        }
        if current.scheduled_at() != lesson.scheduled_at()
            || current.duration_minutes() != lesson.duration_minutes()
        {
            let moved = self.reschedule_lesson(lesson_id, &current)?;
            info!(booking_id = %booking_id, lesson_id = %lesson_id, "lesson created");
            return Ok(moved);
        }

        info!(booking_id = %booking_id, lesson_id = %lesson_id, "lesson created");
        Ok(lesson)
    }

    /// `Scheduled → InProgress`. A lesson whose booking is no longer
    /// confirmed is cancelled instead.
    pub fn start_lesson(
        &self,
        lesson_id: LessonId,
        anchor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<Lesson> {
        let lesson = self.lesson(lesson_id)?;
        let booking = self.booking(lesson.booking_id())?;
        if booking.state() != BookingState::Confirmed {
            self.cancel_lesson(lesson_id, now)?;
            return Err(SchedulingError::mismatch(format!(
                "booking {} is {:?}, lesson cancelled",
                booking.id_typed(),
                booking.state()
            )));
        }

        let outcome = self.store.lessons.compare_and_transition(
            &lesson_id,
            LessonState::Scheduled,
            &|l: &mut Lesson| {
                check_anchor(l.scheduled_at(), anchor)?;
                l.apply(LessonTransition::Start, now)
            },
        )?;
        let lesson = settle(outcome, "start", lesson_id)?;
        info!(lesson_id = %lesson_id, booking_id = %lesson.booking_id(), "lesson started");
        Ok(lesson)
    }

    /// `InProgress → Completed`.
    pub fn complete_lesson(
        &self,
        lesson_id: LessonId,
        anchor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<Lesson> {
        let outcome = self.store.lessons.compare_and_transition(
            &lesson_id,
            LessonState::InProgress,
            &|l: &mut Lesson| {
                check_anchor(l.scheduled_at(), anchor)?;
                l.apply(LessonTransition::Complete, now)
            },
        )?;
        let lesson = settle(outcome, "complete", lesson_id)?;
        info!(lesson_id = %lesson_id, booking_id = %lesson.booking_id(), "lesson completed");
        Ok(lesson)
    }

    /// `Confirmed → Completed`.
    pub fn complete_booking(&self, booking_id: BookingId, now: DateTime<Utc>) -> SchedulingResult<Booking> {
        let outcome = self.store.bookings.compare_and_transition(
            &booking_id,
            BookingState::Confirmed,
            &|b: &mut Booking| b.apply(BookingTransition::Complete, now),
        )?;
        let booking = settle(outcome, "complete", booking_id)?;
        info!(booking_id = %booking_id, "booking completed");
        Ok(booking)
    }

    /// Cancel a lesson in whatever non-terminal state it is in.
    ///
    /// Returns `None` when the lesson had already finished.
    pub fn cancel_lesson(&self, lesson_id: LessonId, now: DateTime<Utc>) -> SchedulingResult<Option<Lesson>> {
        let lesson = self.lesson(lesson_id)?;
        if lesson.is_terminal() {
            debug!(lesson_id = %lesson_id, state = ?lesson.state(), "lesson already terminal");
            return Ok(None);
        }
        let outcome = self.store.lessons.compare_and_transition(
            &lesson_id,
            lesson.state(),
            &|l: &mut Lesson| l.apply(LessonTransition::Cancel, now),
        )?;
        let lesson = settle(outcome, "cancel", lesson_id)?;
        info!(lesson_id = %lesson_id, booking_id = %lesson.booking_id(), "lesson cancelled");
        Ok(Some(lesson))
    }

    /// Move a `Scheduled` lesson to its booking's current time.
    pub fn reschedule_lesson(&self, lesson_id: LessonId, booking: &Booking) -> SchedulingResult<Lesson> {
        let (scheduled_at, duration) = (booking.scheduled_at(), booking.duration_minutes());
        let outcome = self.store.lessons.compare_and_transition(
            &lesson_id,
            LessonState::Scheduled,
            &|l: &mut Lesson| l.reschedule(scheduled_at, duration),
        )?;
        let lesson = settle(outcome, "reschedule", lesson_id)?;
        info!(lesson_id = %lesson_id, scheduled_at = %scheduled_at, "lesson rescheduled");
        Ok(lesson)
    }
}

/// Reject a job planned against a different `scheduled_at`.
fn check_anchor(actual: DateTime<Utc>, anchor: Option<DateTime<Utc>>) -> DomainResult<()> {
    match anchor {
        Some(expected) if expected != actual => Err(DomainError::conflict(format!(
            "planned for {expected}, now scheduled at {actual}"
        ))),
        _ => Ok(()),
    }
}

fn settle<T, I>(outcome: CasOutcome<T>, action: &str, id: I) -> SchedulingResult<T>
where
    T: Entity,
    I: std::fmt::Display,
{
    match outcome {
        CasOutcome::Applied(entity) => Ok(entity),
        CasOutcome::Mismatch(current) => Err(SchedulingError::mismatch(format!(
            "cannot {action} {id}: state is {:?}",
            current.state()
        ))),
        CasOutcome::NotFound => Err(SchedulingError::validation(format!("{id} not found"))),
    }
}
