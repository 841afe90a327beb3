//! Domain event entry points.
//!
//! Every handler re-reads the subject, cancels the jobs that its previous
//! state had planned and plans for the state it is in now. Events may arrive
//! late, twice or out of order; planning always follows the stored state,
//! never the event payload.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use lessonflow_booking::{
    Booking, BookingEvent, BookingState, Event, Lesson, LessonState, ReminderTrigger,
};
use lessonflow_core::{BookingId, Entity, LessonId, SharedClock};

use crate::error::SchedulingResult;
use crate::lifecycle::{LifecycleScheduler, LifecycleSubject};
use crate::notifications::NotificationScheduler;
use crate::transitions::Transitions;

#[derive(Clone)]
pub struct SchedulingOrchestrator {
    transitions: Transitions,
    lifecycle: LifecycleScheduler,
    notifications: NotificationScheduler,
    clock: SharedClock,
}

impl SchedulingOrchestrator {
    pub fn new(
        transitions: Transitions,
        lifecycle: LifecycleScheduler,
        notifications: NotificationScheduler,
        clock: SharedClock,
    ) -> Self {
        Self {
            transitions,
            lifecycle,
            notifications,
            clock,
        }
    }

    pub fn transitions(&self) -> &Transitions {
        &self.transitions
    }

    pub fn lifecycle(&self) -> &LifecycleScheduler {
        &self.lifecycle
    }

    pub fn notifications(&self) -> &NotificationScheduler {
        &self.notifications
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Dispatch one committed domain event.
    pub fn handle(&self, event: &BookingEvent) {
        debug!(event = event.event_type(), occurred_at = %event.occurred_at(), "handling domain event");
        match event {
            BookingEvent::Created { booking_id, .. } => self.on_created(*booking_id),
            BookingEvent::Confirmed { booking_id, .. } => self.on_confirmed(*booking_id),
            BookingEvent::Cancelled { booking_id, .. } => self.on_cancelled(*booking_id),
            BookingEvent::Rescheduled {
                booking_id,
                previous_scheduled_at,
                ..
            } => self.on_rescheduled(*booking_id, *previous_scheduled_at),
            BookingEvent::LessonCompleted { lesson_id, .. } => self.on_lesson_completed(*lesson_id),
        }
    }

    /// Plan expiry, auto-confirmation and pending-request reminders.
    pub fn on_created(&self, booking_id: BookingId) {
        let result = self.sync_booking(booking_id, self.clock.now());
        report("booking.created", booking_id, result);
    }

    /// Drop expiry planning; plan lesson creation, the no-show check and
    /// lesson-start reminders.
    pub fn on_confirmed(&self, booking_id: BookingId) {
        let result = self.sync_booking(booking_id, self.clock.now());
        report("booking.confirmed", booking_id, result);
    }

    /// Cancel everything planned for the booking and its lesson.
    pub fn on_cancelled(&self, booking_id: BookingId) {
        let result = self.sync_booking(booking_id, self.clock.now());
        report("booking.cancelled", booking_id, result);
    }

    /// Move a not-yet-started lesson along with its booking and replan both.
    pub fn on_rescheduled(&self, booking_id: BookingId, previous_scheduled_at: DateTime<Utc>) {
        let now = self.clock.now();
        let result = self.reschedule(booking_id, previous_scheduled_at, now);
        report("booking.rescheduled", booking_id, result);
    }

    /// Finish the booking behind a completed lesson and ask for a review.
    pub fn on_lesson_completed(&self, lesson_id: LessonId) {
        let now = self.clock.now();
        let result = self.transitions.lesson(lesson_id).and_then(|lesson| {
            if lesson.state() == LessonState::Completed {
                self.after_lesson_completed(&lesson, now).map(|_| ())
            } else {
                debug!(lesson_id = %lesson_id, state = ?lesson.state(), "lesson not completed, replanning");
                self.replan_lesson(&lesson, now)
            }
        });
        report("lesson.completed", lesson_id, result);
    }

    fn sync_booking(&self, booking_id: BookingId, now: DateTime<Utc>) -> SchedulingResult<()> {
        let booking = self.transitions.booking(booking_id)?;
        self.replan_booking(&booking, now)
    }

    fn reschedule(
        &self,
        booking_id: BookingId,
        previous_scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<()> {
        let booking = self.transitions.booking(booking_id)?;
        info!(
            booking_id = %booking_id,
            from = %previous_scheduled_at,
            to = %booking.scheduled_at(),
            "booking rescheduled"
        );

        if let Some(lesson) = self.transitions.live_lesson_for(booking_id)? {
            self.lifecycle.cancel_lesson_jobs(lesson.id_typed(), now)?;
            let moved = lesson.state() == LessonState::Scheduled
                && !booking.is_terminal()
                && (lesson.scheduled_at() != booking.scheduled_at()
                    || lesson.duration_minutes() != booking.duration_minutes());
            let lesson = if moved {
                match self.transitions.reschedule_lesson(lesson.id_typed(), &booking) {
                    Ok(lesson) => lesson,
                    Err(err) if err.is_mismatch() => {
                        debug!(lesson_id = %lesson.id_typed(), reason = %err, "lesson not moved");
                        self.transitions.lesson(lesson.id_typed())?
                    }
                    Err(err) => return Err(err),
                }
            } else {
                lesson
            };
            self.replan_lesson(&lesson, now)?;
        }

        self.replan_booking(&booking, now)
    }

    /// Replace the booking's lifecycle jobs and reminders with the ones its
    /// current state calls for.
    ///
    /// Review reminders of a completed booking are left in place.
    pub(crate) fn replan_booking(&self, booking: &Booking, now: DateTime<Utc>) -> SchedulingResult<()> {
        let booking_id = booking.id_typed();
        self.lifecycle.cancel_booking_jobs(booking_id, now)?;

        match booking.state() {
            BookingState::Pending => {
                self.plan_booking_lifecycle(booking, false, now)?;
                let trigger = ReminderTrigger::BookingExpiry {
                    at: self.lifecycle.expiry_deadline(booking),
                };
                self.notifications.plan_for(booking, trigger, now)?;
            }
            BookingState::Confirmed => {
                let has_lesson = self.transitions.live_lesson_for(booking_id)?.is_some();
                self.plan_booking_lifecycle(booking, has_lesson, now)?;
                let trigger = ReminderTrigger::LessonStart {
                    at: booking.scheduled_at(),
                };
                self.notifications.plan_for(booking, trigger, now)?;
            }
            BookingState::Cancelled => {
                self.notifications.cancel_reminders(booking_id, now)?;
                if let Some(lesson) = self.transitions.store().lesson_for_booking(booking_id)? {
                    self.lifecycle.cancel_lesson_jobs(lesson.id_typed(), now)?;
                    match self.transitions.cancel_lesson(lesson.id_typed(), now) {
                        Ok(_) => {}
                        Err(err) if err.is_mismatch() => {
                            debug!(lesson_id = %lesson.id_typed(), reason = %err, "lesson cancel raced");
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            BookingState::Completed => {
                debug!(booking_id = %booking_id, "booking completed, nothing left to plan");
            }
        }
        Ok(())
    }

    /// Replan only the booking's lifecycle jobs, leaving reminders alone.
    pub(crate) fn plan_booking_lifecycle(
        &self,
        booking: &Booking,
        has_lesson: bool,
        now: DateTime<Utc>,
    ) -> SchedulingResult<()> {
        self.lifecycle.cancel_booking_jobs(booking.id_typed(), now)?;
        self.lifecycle
            .plan_next_transition(LifecycleSubject::Booking { booking, has_lesson }, now)?;
        Ok(())
    }

    pub(crate) fn replan_lesson(&self, lesson: &Lesson, now: DateTime<Utc>) -> SchedulingResult<()> {
        self.lifecycle.cancel_lesson_jobs(lesson.id_typed(), now)?;
        self.lifecycle
            .plan_next_transition(LifecycleSubject::Lesson(lesson), now)?;
        Ok(())
    }

    /// Complete the booking behind a completed lesson.
    ///
    /// Returns whether this call completed the booking; only then is the
    /// review reminder planned, so repeated completion signals plan it once.
    pub(crate) fn after_lesson_completed(&self, lesson: &Lesson, now: DateTime<Utc>) -> SchedulingResult<bool> {
        self.lifecycle.cancel_lesson_jobs(lesson.id_typed(), now)?;

        let booking_id = lesson.booking_id();
        let completed = match self.transitions.complete_booking(booking_id, now) {
            Ok(_) => true,
            Err(err) if err.is_mismatch() => {
                debug!(booking_id = %booking_id, reason = %err, "booking not completed");
                false
            }
            Err(err) => return Err(err),
        };

        let booking = self.transitions.booking(booking_id)?;
        self.replan_booking(&booking, now)?;
        if completed {
            let trigger = ReminderTrigger::LessonCompleted {
                at: lesson.completed_at().unwrap_or(now),
            };
            self.notifications.plan_for(&booking, trigger, now)?;
        }
        Ok(completed)
    }
}

impl std::fmt::Debug for SchedulingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingOrchestrator")
            .field("windows", self.lifecycle.windows())
            .finish_non_exhaustive()
    }
}

fn report(event: &'static str, subject: impl std::fmt::Display, result: SchedulingResult<()>) {
    if let Err(err) = result {
        error!(event, subject = %subject, error = %err, "scheduling handler failed");
    }
}
