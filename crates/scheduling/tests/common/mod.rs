#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use lessonflow_booking::{Booking, BookingEvent, BookingState, BookingTransition, Lesson, NewBooking};
use lessonflow_core::{BookingId, Clock, Entity, ManualClock, UserId};
use lessonflow_infra::jobs::{JobStore, ScheduledJob, SubjectId};
use lessonflow_infra::{CasOutcome, RecordingDispatcher, Repository};
use lessonflow_scheduling::{SchedulingConfig, SchedulingEngine};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub engine: SchedulingEngine,
}

pub fn harness() -> Harness {
    let clock = ManualClock::arc(t0());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let engine = SchedulingEngine::in_memory(SchedulingConfig::default(), dispatcher.clone(), clock.clone());
    Harness {
        clock,
        dispatcher,
        engine,
    }
}

impl Harness {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Commit a booking created now and publish `Created`.
    pub fn book(&self, scheduled_in: Duration, instant_confirm: bool) -> BookingId {
        let now = self.now();
        let booking = Booking::create(NewBooking {
            id: BookingId::new(),
            student_id: UserId::new(),
            tutor_id: UserId::new(),
            scheduled_at: now + scheduled_in,
            duration_minutes: 60,
            instant_confirm,
            created_at: now,
        })
        .unwrap();
        let id = booking.id_typed();
        self.engine.store().bookings.insert(booking).unwrap();
        self.engine.handle(&BookingEvent::Created {
            booking_id: id,
            occurred_at: now,
        });
        id
    }

    /// Apply a user-driven transition if the booking is in `from`, then
    /// publish `event` regardless.
    pub fn commit(&self, id: BookingId, from: BookingState, t: BookingTransition, event: BookingEvent) -> bool {
        let now = self.now();
        let outcome = self
            .engine
            .store()
            .bookings
            .compare_and_transition(&id, from, &|b: &mut Booking| b.apply(t, now))
            .unwrap();
        self.engine.handle(&event);
        outcome.is_applied()
    }

    pub fn confirm(&self, id: BookingId) -> bool {
        let event = BookingEvent::Confirmed {
            booking_id: id,
            occurred_at: self.now(),
        };
        self.commit(id, BookingState::Pending, BookingTransition::Confirm, event)
    }

    pub fn cancel(&self, id: BookingId) -> bool {
        let state = self.booking(id).state();
        if matches!(state, BookingState::Completed | BookingState::Cancelled) {
            return false;
        }
        let event = BookingEvent::Cancelled {
            booking_id: id,
            occurred_at: self.now(),
        };
        self.commit(id, state, BookingTransition::Cancel, event)
    }

    pub fn reschedule(&self, id: BookingId, to: DateTime<Utc>) -> bool {
        let current = self.booking(id);
        if matches!(current.state(), BookingState::Completed | BookingState::Cancelled) {
            return false;
        }
        let now = self.now();
        let outcome = self
            .engine
            .store()
            .bookings
            .compare_and_transition(&id, current.state(), &|b: &mut Booking| b.reschedule(to, 60, now))
            .unwrap();
        self.engine.handle(&BookingEvent::Rescheduled {
            booking_id: id,
            previous_scheduled_at: current.scheduled_at(),
            occurred_at: now,
        });
        matches!(outcome, CasOutcome::Applied(_))
    }

    /// Step the clock from trigger to trigger, executing due jobs at each,
    /// then land on `until`.
    pub fn run_until(&self, until: DateTime<Utc>) {
        for _ in 0..10_000 {
            let next = self.engine.jobs().upcoming(1).unwrap();
            match next.first() {
                Some(trigger) if trigger.trigger_at <= until => {
                    if trigger.trigger_at > self.now() {
                        self.clock.set(trigger.trigger_at);
                    }
                    self.engine.run_due().unwrap();
                }
                _ => {
                    if until > self.now() {
                        self.clock.set(until);
                    }
                    self.engine.run_due().unwrap();
                    return;
                }
            }
        }
        panic!("job queue did not settle");
    }

    pub fn booking(&self, id: BookingId) -> Booking {
        self.engine.store().bookings.get(&id).unwrap().unwrap()
    }

    pub fn lesson_of(&self, id: BookingId) -> Option<Lesson> {
        self.engine.store().lesson_for_booking(id).unwrap()
    }

    pub fn pending(&self, subject: impl Into<SubjectId>) -> Vec<ScheduledJob> {
        self.engine.jobs().pending_for(subject.into()).unwrap()
    }

    pub fn pending_keys(&self, subject: impl Into<SubjectId>) -> Vec<String> {
        self.pending(subject).iter().map(|j| j.action_key()).collect()
    }

    /// Drop every pending job for the subject, as if the broker lost them.
    pub fn lose_jobs(&self, subject: impl Into<SubjectId>, prefix: &str) -> usize {
        self.engine.jobs().cancel_where(subject.into(), prefix, self.now()).unwrap()
    }

    pub fn bookings(&self) -> Vec<Booking> {
        self.engine.store().bookings.scan(None, &|_: &Booking| true, usize::MAX).unwrap()
    }

    pub fn lessons(&self) -> Vec<Lesson> {
        self.engine.store().lessons.scan(None, &|_: &Lesson| true, usize::MAX).unwrap()
    }

    /// No two pending jobs share a `(subject_id, action_key)`.
    pub fn assert_unique_pending(&self) {
        let mut seen = HashSet::new();
        for trigger in self.engine.jobs().upcoming(usize::MAX).unwrap() {
            assert!(
                seen.insert((trigger.subject_id, trigger.action_key.clone())),
                "duplicate pending job {} for {}",
                trigger.action_key,
                trigger.subject_id
            );
        }
    }
}
