//! Job execution: one exhaustive dispatch over [`JobAction`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use lessonflow_booking::{Audience, Booking};
use lessonflow_core::{Entity, SharedClock};
use lessonflow_infra::jobs::{JobAction, JobHandler, JobResult, ReminderJob, ScheduledJob};
use lessonflow_infra::{NotificationDispatcher, OutboundNotification};

use crate::error::{SchedulingError, SchedulingResult};
use crate::orchestrator::SchedulingOrchestrator;

/// Runs due jobs against the entity store.
///
/// Each action re-reads its subject, applies one guarded transition through
/// [`crate::transitions::Transitions`] and then plans the follow-up jobs.
pub struct JobProcessor {
    orchestrator: SchedulingOrchestrator,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: SharedClock,
}

impl JobProcessor {
    pub fn new(
        orchestrator: SchedulingOrchestrator,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: SharedClock,
    ) -> Self {
        Self {
            orchestrator,
            dispatcher,
            clock,
        }
    }

    /// Execute `action` at `now`.
    pub fn process(&self, action: &JobAction, now: DateTime<Utc>) -> SchedulingResult<()> {
        let transitions = self.orchestrator.transitions();
        match action {
            JobAction::ExpireBooking { booking_id } => {
                let booking = transitions.expire_booking(*booking_id, now)?;
                follow_up(action, self.orchestrator.replan_booking(&booking, now));
            }
            JobAction::AutoConfirmBooking { booking_id } => {
                let booking = transitions.auto_confirm_booking(*booking_id, now)?;
                follow_up(action, self.orchestrator.replan_booking(&booking, now));
            }
            JobAction::NoShowCheck {
                booking_id,
                scheduled_at,
            } => {
                let booking = transitions.no_show(*booking_id, Some(*scheduled_at), now)?;
                follow_up(action, self.orchestrator.replan_booking(&booking, now));
            }
            JobAction::CreateLesson {
                booking_id,
                scheduled_at,
            } => {
                let lesson = transitions.create_lesson(*booking_id, Some(*scheduled_at), now)?;
                follow_up(action, self.orchestrator.replan_lesson(&lesson, now));
            }
            JobAction::StartLesson {
                lesson_id,
                scheduled_at,
            } => {
                let lesson = transitions.start_lesson(*lesson_id, Some(*scheduled_at), now)?;
                follow_up(action, self.orchestrator.replan_lesson(&lesson, now));
            }
            JobAction::CompleteLesson {
                lesson_id,
                scheduled_at,
            } => {
                let lesson = transitions.complete_lesson(*lesson_id, Some(*scheduled_at), now)?;
                follow_up(
                    action,
                    self.orchestrator.after_lesson_completed(&lesson, now).map(|_| ()),
                );
            }
            JobAction::SendReminder(reminder) => self.deliver(reminder)?,
        }
        Ok(())
    }

    /// Send a reminder if the booking still looks the way it did when the
    /// reminder was planned.
    fn deliver(&self, reminder: &ReminderJob) -> SchedulingResult<()> {
        let booking = self.orchestrator.transitions().booking(reminder.booking_id)?;
        if booking.state() != reminder.expects {
            return Err(SchedulingError::mismatch(format!(
                "booking is {:?}, reminder expects {:?}",
                booking.state(),
                reminder.expects
            )));
        }
        if booking.scheduled_at() != reminder.anchor {
            return Err(SchedulingError::mismatch(format!(
                "booking moved from {} to {}",
                reminder.anchor,
                booking.scheduled_at()
            )));
        }

        let notification = outbound(&booking, reminder);
        if let Err(err) = self.dispatcher.dispatch(&notification) {
            warn!(
                booking_id = %reminder.booking_id,
                template = %reminder.template_key,
                audience = reminder.audience.as_str(),
                error = %err,
                "reminder dispatch failed"
            );
            return Err(err.into());
        }
        info!(
            booking_id = %reminder.booking_id,
            template = %reminder.template_key,
            audience = reminder.audience.as_str(),
            "reminder sent"
        );
        Ok(())
    }
}

impl JobHandler for JobProcessor {
    fn handle(&self, job: &ScheduledJob) -> JobResult {
        let now = self.clock.now();
        match self.process(&job.action, now) {
            Ok(()) => JobResult::Success,
            Err(err) => {
                if err.is_mismatch() {
                    debug!(job_id = %job.id, action = %job.action_key(), reason = %err, "precondition no longer holds");
                } else {
                    warn!(job_id = %job.id, action = %job.action_key(), attempt = job.attempt, error = %err, "job failed");
                }
                err.into_job_result()
            }
        }
    }
}

fn follow_up(action: &JobAction, result: SchedulingResult<()>) {
    if let Err(err) = result {
        warn!(
            action = %action.action_key(),
            subject_id = %action.subject_id(),
            error = %err,
            "follow-up planning failed"
        );
    }
}

fn outbound(booking: &Booking, reminder: &ReminderJob) -> OutboundNotification {
    let recipient = match reminder.audience {
        Audience::Student => booking.student_id(),
        Audience::Tutor => booking.tutor_id(),
    };
    OutboundNotification {
        dedupe_key: format!(
            "{}:{}:{}:{:?}:{}",
            reminder.booking_id,
            reminder.template_key,
            reminder.audience.as_str(),
            reminder.channel,
            reminder.send_at.timestamp()
        ),
        booking_id: reminder.booking_id,
        recipient,
        audience: reminder.audience,
        channel: reminder.channel,
        template_key: reminder.template_key.clone(),
        send_at: reminder.send_at,
        context: json!({
            "booking_id": reminder.booking_id,
            "scheduled_at": booking.scheduled_at(),
            "duration_minutes": booking.duration_minutes(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, TimeZone};
    use lessonflow_booking::{
        BookingState, BookingTransition, Channel, NewBooking, ReminderPlanner,
    };
    use lessonflow_core::{BookingId, LessonId, ManualClock, UserId};
    use lessonflow_infra::jobs::InMemoryJobStore;
    use lessonflow_infra::{EntityStore, RecordingDispatcher};

    use crate::config::{LifecycleConfig, RetryConfig};
    use crate::lifecycle::LifecycleScheduler;
    use crate::notifications::NotificationScheduler;
    use crate::transitions::Transitions;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn processor() -> (EntityStore, Arc<RecordingDispatcher>, JobProcessor) {
        let jobs = InMemoryJobStore::arc();
        let store = EntityStore::in_memory();
        let clock = ManualClock::arc(t0());
        let orchestrator = SchedulingOrchestrator::new(
            Transitions::new(store.clone()),
            LifecycleScheduler::new(jobs.clone(), LifecycleConfig::default(), RetryConfig::default()),
            NotificationScheduler::new(jobs, ReminderPlanner::default(), RetryConfig::default()),
            clock.clone(),
        );
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let processor = JobProcessor::new(orchestrator, dispatcher.clone(), clock);
        (store, dispatcher, processor)
    }

    fn confirmed(store: &EntityStore) -> Booking {
        let mut booking = Booking::create(NewBooking {
            id: BookingId::new(),
            student_id: UserId::new(),
            tutor_id: UserId::new(),
            scheduled_at: t0() + Duration::hours(26),
            duration_minutes: 60,
            instant_confirm: false,
            created_at: t0(),
        })
        .unwrap();
        booking.apply(BookingTransition::Confirm, t0()).unwrap();
        store.bookings.insert(booking.clone()).unwrap();
        booking
    }

    fn reminder(booking: &Booking, expects: BookingState) -> ReminderJob {
        ReminderJob {
            booking_id: booking.id_typed(),
            audience: Audience::Tutor,
            channel: Channel::Email,
            template_key: "lesson.reminder_24h".to_string(),
            send_at: booking.scheduled_at() - Duration::hours(24),
            expects,
            anchor: booking.scheduled_at(),
        }
    }

    #[test]
    fn reminder_goes_to_the_audience() {
        let (store, dispatcher, processor) = processor();
        let booking = confirmed(&store);
        let job = ScheduledJob::new(
            JobAction::SendReminder(reminder(&booking, BookingState::Confirmed)),
            t0(),
            t0(),
        );

        assert_eq!(processor.handle(&job), JobResult::Success);
        let sent = dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, booking.tutor_id());
        assert_eq!(sent[0].context["duration_minutes"], 60);
    }

    #[test]
    fn stale_reminders_are_skipped() {
        let (store, dispatcher, processor) = processor();
        let booking = confirmed(&store);

        let wrong_state = ScheduledJob::new(
            JobAction::SendReminder(reminder(&booking, BookingState::Pending)),
            t0(),
            t0(),
        );
        assert!(matches!(processor.handle(&wrong_state), JobResult::Skipped(_)));

        let mut moved = reminder(&booking, BookingState::Confirmed);
        moved.anchor = t0() + Duration::hours(3);
        let moved = ScheduledJob::new(JobAction::SendReminder(moved), t0(), t0());
        assert!(matches!(processor.handle(&moved), JobResult::Skipped(_)));

        assert!(dispatcher.sent().is_empty());
    }

    #[test]
    fn dispatch_outage_is_transient() {
        let (store, dispatcher, processor) = processor();
        let booking = confirmed(&store);
        dispatcher.fail_next(1);
        let job = ScheduledJob::new(
            JobAction::SendReminder(reminder(&booking, BookingState::Confirmed)),
            t0(),
            t0(),
        );
        assert!(matches!(processor.handle(&job), JobResult::Retry(_)));
    }

    #[test]
    fn missing_subjects_are_dropped() {
        let (_, _, processor) = processor();
        let job = ScheduledJob::new(
            JobAction::StartLesson {
                lesson_id: LessonId::new(),
                scheduled_at: t0(),
            },
            t0(),
            t0(),
        );
        assert!(matches!(processor.handle(&job), JobResult::Drop(_)));
    }

    #[test]
    fn create_lesson_job_runs_once() {
        let (store, _, processor) = processor();
        let booking = confirmed(&store);
        let action = JobAction::CreateLesson {
            booking_id: booking.id_typed(),
            scheduled_at: booking.scheduled_at(),
        };
        let job = ScheduledJob::new(action, t0(), t0());

        assert_eq!(processor.handle(&job), JobResult::Success);
        assert!(matches!(processor.handle(&job), JobResult::Skipped(_)));
        assert!(store.lesson_for_booking(booking.id_typed()).unwrap().is_some());
    }
}
