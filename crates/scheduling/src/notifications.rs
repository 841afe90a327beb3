//! Reminder job planning.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info};

use lessonflow_booking::{
    Booking, BookingState, ReminderPlanner, ReminderSpec, ReminderTrigger,
};
use lessonflow_core::{BookingId, Entity};
use lessonflow_infra::jobs::{
    ActionClass, JobAction, JobHandle, JobStore, REMINDER_PREFIX, ReminderJob, ScheduledJob,
};

use crate::config::RetryConfig;
use crate::error::SchedulingResult;
use crate::lifecycle::enqueue;

/// Schedules and cancels reminder jobs keyed to a booking.
#[derive(Clone)]
pub struct NotificationScheduler {
    jobs: Arc<dyn JobStore>,
    planner: ReminderPlanner,
    retry: RetryConfig,
}

impl NotificationScheduler {
    pub fn new(jobs: Arc<dyn JobStore>, planner: ReminderPlanner, retry: RetryConfig) -> Self {
        Self {
            jobs,
            planner,
            retry,
        }
    }

    pub fn planner(&self) -> &ReminderPlanner {
        &self.planner
    }

    /// Plan the policy's reminders for `trigger`.
    pub fn plan_for(
        &self,
        booking: &Booking,
        trigger: ReminderTrigger,
        now: DateTime<Utc>,
    ) -> SchedulingResult<Vec<JobHandle>> {
        let specs = self.planner.plan(&trigger);
        self.plan_reminders(booking, trigger, &specs, now)
    }

    /// Replace the booking's reminder jobs with one job per `(spec, audience)`.
    ///
    /// Existing reminders are cancelled first. Send times at or before `now`
    /// are skipped, never back-filled, and identical
    /// `(template, audience, channel, send_at)` entries are enqueued once.
    pub fn plan_reminders(
        &self,
        booking: &Booking,
        trigger: ReminderTrigger,
        specs: &[ReminderSpec],
        now: DateTime<Utc>,
    ) -> SchedulingResult<Vec<JobHandle>> {
        let booking_id = booking.id_typed();
        self.cancel_reminders(booking_id, now)?;

        let expects = expected_state(&trigger);
        let mut seen = HashSet::new();
        let mut handles = Vec::new();

        for spec in specs {
            let send_at = spec.send_at(trigger.at());
            if send_at <= now {
                debug!(
                    booking_id = %booking_id,
                    template = %spec.template_key,
                    send_at = %send_at,
                    "reminder send time already passed, skipping"
                );
                continue;
            }

            for &audience in &spec.audiences {
                if !seen.insert((spec.template_key.as_str(), audience, spec.channel, send_at)) {
                    continue;
                }

                let action = JobAction::SendReminder(ReminderJob {
                    booking_id,
                    audience,
                    channel: spec.channel,
                    template_key: spec.template_key.clone(),
                    send_at,
                    expects,
                    anchor: booking.scheduled_at(),
                });
                let job = ScheduledJob::new(action, send_at, now)
                    .with_retry_policy(self.retry.policy_for(ActionClass::Reminder))
                    .with_metadata(json!({
                        "planned_by": "notifications",
                        "trigger": trigger.kind(),
                        "trigger_at": trigger.at(),
                    }));
                if let Some(handle) = enqueue(self.jobs.as_ref(), job)? {
                    handles.push(handle);
                }
            }
        }

        if !handles.is_empty() {
            info!(
                booking_id = %booking_id,
                trigger = trigger.kind(),
                planned = handles.len(),
                "planned reminders"
            );
        }
        Ok(handles)
    }

    /// Cancel every pending reminder for the booking.
    pub fn cancel_reminders(&self, booking_id: BookingId, now: DateTime<Utc>) -> SchedulingResult<usize> {
        let cancelled = self.jobs.cancel_where(booking_id.into(), REMINDER_PREFIX, now)?;
        if cancelled > 0 {
            debug!(booking_id = %booking_id, cancelled, "cancelled reminders");
        }
        Ok(cancelled)
    }
}

/// Booking state a reminder for `trigger` is only valid in.
fn expected_state(trigger: &ReminderTrigger) -> BookingState {
    match trigger {
        ReminderTrigger::BookingExpiry { .. } => BookingState::Pending,
        ReminderTrigger::LessonStart { .. } => BookingState::Confirmed,
        ReminderTrigger::LessonCompleted { .. } => BookingState::Completed,
    }
}
