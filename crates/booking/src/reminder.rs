//! Reminder planning.
//!
//! [`ReminderPlanner`] is a pure mapping from a trigger event (lesson start,
//! booking expiry, lesson completion) to the reminder specs that apply to it.
//! Specs are regenerated from the [`ReminderPolicy`] every time planning runs;
//! nothing here is persisted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Who receives a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    /// The booking's requester.
    Student,
    /// The booking's counterparty.
    Tutor,
}

impl Audience {
    pub fn as_str(self) -> &'static str {
        match self {
            Audience::Student => "student",
            Audience::Tutor => "tutor",
        }
    }
}

/// Delivery channel requested from the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Push,
    Sms,
}

/// Offset of a reminder relative to its trigger, in minutes.
///
/// Positive values send before the trigger; negative values send after it
/// (follow-ups such as review requests).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReminderOffset(i64);

impl ReminderOffset {
    pub fn before(d: Duration) -> Self {
        Self(d.num_minutes())
    }

    pub fn after(d: Duration) -> Self {
        Self(-d.num_minutes())
    }

    pub fn minutes(self) -> i64 {
        self.0
    }

    pub fn send_at(self, trigger_at: DateTime<Utc>) -> DateTime<Utc> {
        trigger_at - Duration::minutes(self.0)
    }
}

/// A single reminder rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReminderSpec {
    pub offset_before_trigger: ReminderOffset,
    pub audiences: Vec<Audience>,
    pub channel: Channel,
    pub template_key: String,
}

impl ReminderSpec {
    pub fn new(
        offset_before_trigger: ReminderOffset,
        audiences: &[Audience],
        channel: Channel,
        template_key: impl Into<String>,
    ) -> Self {
        Self {
            offset_before_trigger,
            audiences: audiences.to_vec(),
            channel,
            template_key: template_key.into(),
        }
    }

    pub fn send_at(&self, trigger_at: DateTime<Utc>) -> DateTime<Utc> {
        self.offset_before_trigger.send_at(trigger_at)
    }
}

/// The event reminders are anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReminderTrigger {
    /// A confirmed lesson starts at `at`.
    LessonStart { at: DateTime<Utc> },
    /// A pending booking expires at `at` unless confirmed.
    BookingExpiry { at: DateTime<Utc> },
    /// A lesson completed at `at`.
    LessonCompleted { at: DateTime<Utc> },
}

impl ReminderTrigger {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            ReminderTrigger::LessonStart { at }
            | ReminderTrigger::BookingExpiry { at }
            | ReminderTrigger::LessonCompleted { at } => *at,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ReminderTrigger::LessonStart { .. } => "lesson_start",
            ReminderTrigger::BookingExpiry { .. } => "booking_expiry",
            ReminderTrigger::LessonCompleted { .. } => "lesson_completed",
        }
    }
}

/// Reminder rules per trigger kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReminderPolicy {
    pub lesson_start: Vec<ReminderSpec>,
    pub booking_expiry: Vec<ReminderSpec>,
    pub lesson_completed: Vec<ReminderSpec>,
}

impl Default for ReminderPolicy {
    fn default() -> Self {
        use Audience::*;

        Self {
            lesson_start: vec![
                ReminderSpec::new(
                    ReminderOffset::before(Duration::hours(24)),
                    &[Student, Tutor],
                    Channel::Email,
                    "lesson.reminder_24h",
                ),
                ReminderSpec::new(
                    ReminderOffset::before(Duration::hours(1)),
                    &[Student, Tutor],
                    Channel::Push,
                    "lesson.reminder_1h",
                ),
                ReminderSpec::new(
                    ReminderOffset::before(Duration::minutes(15)),
                    &[Student],
                    Channel::Push,
                    "lesson.reminder_15m",
                ),
            ],
            booking_expiry: vec![
                ReminderSpec::new(
                    ReminderOffset::before(Duration::hours(24)),
                    &[Tutor],
                    Channel::Email,
                    "booking.pending_24h",
                ),
                ReminderSpec::new(
                    ReminderOffset::before(Duration::hours(2)),
                    &[Tutor],
                    Channel::Push,
                    "booking.pending_2h",
                ),
            ],
            lesson_completed: vec![ReminderSpec::new(
                ReminderOffset::after(Duration::hours(1)),
                &[Student],
                Channel::Email,
                "lesson.review_request",
            )],
        }
    }
}

/// Maps trigger events to reminder specs.
#[derive(Debug, Clone, Default)]
pub struct ReminderPlanner {
    policy: ReminderPolicy,
}

impl ReminderPlanner {
    pub fn new(policy: ReminderPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ReminderPolicy {
        &self.policy
    }

    /// Specs that apply to `trigger`, ordered by send time.
    pub fn plan(&self, trigger: &ReminderTrigger) -> Vec<ReminderSpec> {
        let rules = match trigger {
            ReminderTrigger::LessonStart { .. } => &self.policy.lesson_start,
            ReminderTrigger::BookingExpiry { .. } => &self.policy.booking_expiry,
            ReminderTrigger::LessonCompleted { .. } => &self.policy.lesson_completed,
        };

        let mut specs: Vec<ReminderSpec> = rules
            .iter()
            .filter(|s| !s.audiences.is_empty())
            .cloned()
            .collect();
        specs.sort_by_key(|s| s.send_at(trigger.at()));
        specs
    }
}
