//! Lifecycle job planning for bookings and lessons.
//!
//! For an entity's current state the scheduler computes the next lifecycle
//! actions and their trigger times, then cancels-then-creates one job per
//! action. Execution lives in [`crate::processor`]; this module only plans.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use lessonflow_booking::{Booking, BookingState, Lesson, LessonState};
use lessonflow_core::{BookingId, Entity, LessonId};
use lessonflow_infra::jobs::{
    JobAction, JobHandle, JobStore, JobStoreError, ScheduledJob, SubjectId,
};

use crate::config::{LifecycleConfig, RetryConfig};
use crate::error::SchedulingResult;

/// An entity whose next lifecycle transition can be planned.
#[derive(Debug, Clone, Copy)]
pub enum LifecycleSubject<'a> {
    Booking {
        booking: &'a Booking,
        /// Whether a lesson has already been materialised for the booking.
        has_lesson: bool,
    },
    Lesson(&'a Lesson),
}

impl LifecycleSubject<'_> {
    fn subject_id(&self) -> SubjectId {
        match self {
            LifecycleSubject::Booking { booking, .. } => booking.id_typed().into(),
            LifecycleSubject::Lesson(lesson) => lesson.id_typed().into(),
        }
    }

    fn state_label(&self) -> String {
        match self {
            LifecycleSubject::Booking { booking, .. } => format!("{:?}", booking.state()),
            LifecycleSubject::Lesson(lesson) => format!("{:?}", lesson.state()),
        }
    }
}

#[derive(Clone)]
pub struct LifecycleScheduler {
    jobs: Arc<dyn JobStore>,
    windows: LifecycleConfig,
    retry: RetryConfig,
}

impl LifecycleScheduler {
    pub fn new(jobs: Arc<dyn JobStore>, windows: LifecycleConfig, retry: RetryConfig) -> Self {
        Self {
            jobs,
            windows,
            retry,
        }
    }

    pub fn windows(&self) -> &LifecycleConfig {
        &self.windows
    }

    /// When a pending booking expires: the expiry window after creation,
    /// whether or not the session start has passed by then.
    pub fn expiry_deadline(&self, booking: &Booking) -> DateTime<Utc> {
        booking.created_at() + self.windows.expiry_window()
    }

    pub fn auto_confirm_at(&self, booking: &Booking) -> DateTime<Utc> {
        booking.created_at() + self.windows.auto_confirm_grace()
    }

    pub fn no_show_deadline(&self, booking: &Booking) -> DateTime<Utc> {
        booking.scheduled_at() + self.windows.no_show_grace()
    }

    pub fn lesson_creation_at(&self, booking: &Booking) -> DateTime<Utc> {
        booking.scheduled_at() - self.windows.lesson_creation_lead()
    }

    pub fn completion_due(&self, lesson: &Lesson) -> DateTime<Utc> {
        lesson.ends_at() + self.windows.completion_buffer()
    }

    /// The lifecycle actions that follow from the subject's current state,
    /// with unclamped trigger times. Terminal states have none.
    pub fn next_transitions(&self, subject: LifecycleSubject<'_>) -> Vec<(JobAction, DateTime<Utc>)> {
        match subject {
            LifecycleSubject::Booking { booking, has_lesson } => {
                let booking_id = booking.id_typed();
                match booking.state() {
                    BookingState::Pending => {
                        let mut actions = vec![(
                            JobAction::ExpireBooking { booking_id },
                            self.expiry_deadline(booking),
                        )];
                        if booking.instant_confirm() {
                            actions.push((
                                JobAction::AutoConfirmBooking { booking_id },
                                self.auto_confirm_at(booking),
                            ));
                        }
                        actions
                    }
                    BookingState::Confirmed => {
                        let scheduled_at = booking.scheduled_at();
                        let mut actions = Vec::with_capacity(2);
                        if !has_lesson {
                            actions.push((
                                JobAction::CreateLesson {
                                    booking_id,
                                    scheduled_at,
                                },
                                self.lesson_creation_at(booking),
                            ));
                        }
                        actions.push((
                            JobAction::NoShowCheck {
                                booking_id,
                                scheduled_at,
                            },
                            self.no_show_deadline(booking),
                        ));
                        actions
                    }
                    BookingState::Completed | BookingState::Cancelled => Vec::new(),
                }
            }
            LifecycleSubject::Lesson(lesson) => {
                let lesson_id = lesson.id_typed();
                let scheduled_at = lesson.scheduled_at();
                match lesson.state() {
                    LessonState::Scheduled => vec![(
                        JobAction::StartLesson {
                            lesson_id,
                            scheduled_at,
                        },
                        scheduled_at,
                    )],
                    LessonState::InProgress => vec![(
                        JobAction::CompleteLesson {
                            lesson_id,
                            scheduled_at,
                        },
                        self.completion_due(lesson),
                    )],
                    LessonState::Completed | LessonState::Cancelled => Vec::new(),
                }
            }
        }
    }

    /// Cancel-then-create the next lifecycle jobs for `subject`.
    ///
    /// Trigger times already in the past are clamped to `now`: lifecycle
    /// transitions are never dropped for lateness.
    pub fn plan_next_transition(
        &self,
        subject: LifecycleSubject<'_>,
        now: DateTime<Utc>,
    ) -> SchedulingResult<Vec<JobHandle>> {
        let subject_id = subject.subject_id();
        let mut handles = Vec::new();

        for (action, trigger_at) in self.next_transitions(subject) {
            let class = action.class();
            self.jobs.cancel_where(subject_id, &action.action_key(), now)?;

            let job = ScheduledJob::new(action, trigger_at.max(now), now)
                .with_retry_policy(self.retry.policy_for(class))
                .with_metadata(json!({
                    "planned_by": "lifecycle",
                    "planned_in_state": subject.state_label(),
                }));
            if let Some(handle) = enqueue(self.jobs.as_ref(), job)? {
                info!(
                    subject_id = %subject_id,
                    action = %handle.action_key,
                    trigger_at = %handle.trigger_at,
                    "planned lifecycle job"
                );
                handles.push(handle);
            }
        }

        Ok(handles)
    }

    /// Cancel pending lifecycle jobs keyed to a booking (including lesson creation).
    pub fn cancel_booking_jobs(&self, booking_id: BookingId, now: DateTime<Utc>) -> SchedulingResult<usize> {
        let subject = SubjectId::from(booking_id);
        let cancelled = self.jobs.cancel_where(subject, "booking.", now)?
            + self.jobs.cancel_where(subject, "lesson.", now)?;
        if cancelled > 0 {
            debug!(booking_id = %booking_id, cancelled, "cancelled booking lifecycle jobs");
        }
        Ok(cancelled)
    }

    pub fn cancel_lesson_jobs(&self, lesson_id: LessonId, now: DateTime<Utc>) -> SchedulingResult<usize> {
        let cancelled = self.jobs.cancel_where(lesson_id.into(), "lesson.", now)?;
        if cancelled > 0 {
            debug!(lesson_id = %lesson_id, cancelled, "cancelled lesson lifecycle jobs");
        }
        Ok(cancelled)
    }
}

/// Enqueue, treating a concurrent planner's identical pending job as success.
pub(crate) fn enqueue(jobs: &dyn JobStore, job: ScheduledJob) -> SchedulingResult<Option<JobHandle>> {
    let handle = JobHandle::from(&job);
    match jobs.enqueue(job) {
        Ok(_) => Ok(Some(handle)),
        Err(JobStoreError::Duplicate { subject_id, action_key }) => {
            debug!(subject_id = %subject_id, action = %action_key, "job already planned");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use lessonflow_booking::{BookingTransition, LessonTransition, NewBooking};
    use lessonflow_core::UserId;
    use lessonflow_infra::jobs::{InMemoryJobStore, JobStatus};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn scheduler() -> (Arc<InMemoryJobStore>, LifecycleScheduler) {
        let jobs = InMemoryJobStore::arc();
        let scheduler =
            LifecycleScheduler::new(jobs.clone(), LifecycleConfig::default(), RetryConfig::default());
        (jobs, scheduler)
    }

    fn booking(scheduled_in: Duration, instant_confirm: bool) -> Booking {
        Booking::create(NewBooking {
            id: BookingId::new(),
            student_id: UserId::new(),
            tutor_id: UserId::new(),
            scheduled_at: t0() + scheduled_in,
            duration_minutes: 60,
            instant_confirm,
            created_at: t0(),
        })
        .unwrap()
    }

    #[test]
    fn pending_booking_plans_expiry_at_48h() {
        let (jobs, scheduler) = scheduler();
        let b = booking(Duration::days(5), false);

        let handles = scheduler
            .plan_next_transition(LifecycleSubject::Booking { booking: &b, has_lesson: false }, t0())
            .unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].action_key, "booking.expire");
        assert_eq!(handles[0].trigger_at, t0() + Duration::hours(48));

        let job = jobs.get(handles[0].job_id).unwrap().unwrap();
        assert_eq!(job.retry_policy.max_attempts, 3);
    }

    #[test]
    fn expiry_is_measured_from_creation_even_for_a_near_session() {
        let (_, scheduler) = scheduler();
        let b = booking(Duration::hours(6), false);
        assert_eq!(scheduler.expiry_deadline(&b), t0() + Duration::hours(48));
    }

    #[test]
    fn instant_confirm_adds_auto_confirm() {
        let (_, scheduler) = scheduler();
        let b = booking(Duration::days(5), true);
        let actions = scheduler.next_transitions(LifecycleSubject::Booking { booking: &b, has_lesson: false });
        let keys: Vec<_> = actions.iter().map(|(a, _)| a.action_key()).collect();
        assert_eq!(keys, vec!["booking.expire", "booking.auto_confirm"]);
        assert_eq!(actions[1].1, t0() + Duration::minutes(5));
    }

    #[test]
    fn confirmed_booking_plans_lesson_creation_and_no_show_check() {
        let (jobs, scheduler) = scheduler();
        let mut b = booking(Duration::hours(72), false);
        b.apply(BookingTransition::Confirm, t0() + Duration::hours(1)).unwrap();

        let handles = scheduler
            .plan_next_transition(LifecycleSubject::Booking { booking: &b, has_lesson: false }, t0())
            .unwrap();
        let planned: Vec<_> = handles.iter().map(|h| (h.action_key.as_str(), h.trigger_at)).collect();
        assert_eq!(
            planned,
            vec![
                ("lesson.create", t0() + Duration::hours(48)),
                ("booking.no_show_check", t0() + Duration::hours(72) + Duration::minutes(30)),
            ]
        );

        let check = jobs.get(handles[1].job_id).unwrap().unwrap();
        assert_eq!(check.retry_policy.max_attempts, 2);

        // With a lesson already in place only the no-show check remains.
        let actions = scheduler.next_transitions(LifecycleSubject::Booking { booking: &b, has_lesson: true });
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn past_triggers_are_clamped_to_now() {
        let (_, scheduler) = scheduler();
        let mut b = booking(Duration::hours(3), false);
        b.apply(BookingTransition::Confirm, t0()).unwrap();

        let now = t0() + Duration::minutes(10);
        let handles = scheduler
            .plan_next_transition(LifecycleSubject::Booking { booking: &b, has_lesson: false }, now)
            .unwrap();
        assert_eq!(handles[0].action_key, "lesson.create");
        assert_eq!(handles[0].trigger_at, now);
    }

    #[test]
    fn replanning_cancels_then_creates() {
        let (jobs, scheduler) = scheduler();
        let b = booking(Duration::days(5), false);
        let subject = LifecycleSubject::Booking { booking: &b, has_lesson: false };

        let first = scheduler.plan_next_transition(subject, t0()).unwrap();
        let second = scheduler.plan_next_transition(subject, t0()).unwrap();

        let pending = jobs.pending_for(b.id_typed().into()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second[0].job_id);
        let old = jobs.get(first[0].job_id).unwrap().unwrap();
        assert!(matches!(old.status, JobStatus::Cancelled));
    }

    #[test]
    fn lesson_plans_start_then_complete() {
        let (_, scheduler) = scheduler();
        let mut b = booking(Duration::hours(2), false);
        b.apply(BookingTransition::Confirm, t0()).unwrap();
        let mut lesson = Lesson::from_booking(LessonId::new(), &b, t0()).unwrap();

        let actions = scheduler.next_transitions(LifecycleSubject::Lesson(&lesson));
        assert_eq!(actions[0].0.action_key(), "lesson.start");
        assert_eq!(actions[0].1, t0() + Duration::hours(2));

        lesson.apply(LessonTransition::Start, t0() + Duration::hours(2)).unwrap();
        let actions = scheduler.next_transitions(LifecycleSubject::Lesson(&lesson));
        assert_eq!(actions[0].0.action_key(), "lesson.complete");
        assert_eq!(actions[0].1, t0() + Duration::hours(2) + Duration::minutes(75));

        lesson.apply(LessonTransition::Complete, t0() + Duration::hours(4)).unwrap();
        assert!(scheduler.next_transitions(LifecycleSubject::Lesson(&lesson)).is_empty());
    }

    #[test]
    fn cancel_booking_jobs_leaves_reminders_alone() {
        let (jobs, scheduler) = scheduler();
        let mut b = booking(Duration::hours(72), false);
        b.apply(BookingTransition::Confirm, t0()).unwrap();
        scheduler
            .plan_next_transition(LifecycleSubject::Booking { booking: &b, has_lesson: false }, t0())
            .unwrap();

        assert_eq!(scheduler.cancel_booking_jobs(b.id_typed(), t0()).unwrap(), 2);
        assert!(jobs.pending_for(b.id_typed().into()).unwrap().is_empty());
    }
}
