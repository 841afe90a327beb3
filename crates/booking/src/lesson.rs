use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use lessonflow_core::lifecycle::rejected;
use lessonflow_core::{BookingId, DomainError, DomainResult, Entity, LessonId, Lifecycle};

use crate::booking::{Booking, BookingState, validate_duration};

/// Lesson occurrence lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonState {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

/// Edges of the lesson state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonTransition {
    Start,
    Complete,
    Cancel,
}

impl LessonState {
    pub const ALL: [LessonState; 4] = [
        LessonState::Scheduled,
        LessonState::InProgress,
        LessonState::Completed,
        LessonState::Cancelled,
    ];
}

impl LessonTransition {
    pub const ALL: [LessonTransition; 3] = [
        LessonTransition::Start,
        LessonTransition::Complete,
        LessonTransition::Cancel,
    ];
}

impl Lifecycle for LessonState {
    type Transition = LessonTransition;

    fn next(self, transition: LessonTransition) -> DomainResult<Self> {
        use LessonState::*;
        use LessonTransition::*;

        match (self, transition) {
            (Scheduled, Start) => Ok(InProgress),
            (InProgress, Complete) => Ok(Completed),
            (Scheduled, Cancel) | (InProgress, Cancel) => Ok(Cancelled),
            (Scheduled, Complete)
            | (InProgress, Start)
            | (Completed, _)
            | (Cancelled, _) => Err(rejected(self, transition)),
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, LessonState::Completed | LessonState::Cancelled)
    }
}

/// A concrete session materialised from a confirmed booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    id: LessonId,
    booking_id: BookingId,
    scheduled_at: DateTime<Utc>,
    duration_minutes: u32,
    state: LessonState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl Lesson {
    /// Materialise the lesson for a booking. Only confirmed bookings have lessons.
    pub fn from_booking(id: LessonId, booking: &Booking, at: DateTime<Utc>) -> DomainResult<Self> {
        if booking.state() != BookingState::Confirmed {
            return Err(DomainError::invariant(format!(
                "lessons are only created for confirmed bookings (booking is {:?})",
                booking.state()
            )));
        }

        Ok(Self {
            id,
            booking_id: booking.id_typed(),
            scheduled_at: booking.scheduled_at(),
            duration_minutes: booking.duration_minutes(),
            state: LessonState::Scheduled,
            created_at: at,
            started_at: None,
            completed_at: None,
        })
    }

    /// Repository key enforcing one lesson per booking.
    pub fn booking_key(booking_id: BookingId) -> String {
        format!("booking:{booking_id}")
    }

    pub fn id_typed(&self) -> LessonId {
        self.id
    }

    pub fn booking_id(&self) -> BookingId {
        self.booking_id
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.scheduled_at + Duration::minutes(i64::from(self.duration_minutes))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn apply(&mut self, transition: LessonTransition, at: DateTime<Utc>) -> DomainResult<()> {
        let next = self.state.next(transition)?;
        match transition {
            LessonTransition::Start => self.started_at = Some(at),
            LessonTransition::Complete => self.completed_at = Some(at),
            LessonTransition::Cancel => {}
        }
        self.state = next;
        Ok(())
    }

    /// Follow a booking reschedule. Only lessons that have not started can move.
    pub fn reschedule(&mut self, scheduled_at: DateTime<Utc>, duration_minutes: u32) -> DomainResult<()> {
        if self.state != LessonState::Scheduled {
            return Err(DomainError::invariant(format!(
                "cannot reschedule a {:?} lesson",
                self.state
            )));
        }
        validate_duration(duration_minutes)?;
        self.scheduled_at = scheduled_at;
        self.duration_minutes = duration_minutes;
        Ok(())
    }
}

impl Entity for Lesson {
    type Id = LessonId;
    type State = LessonState;

    fn id(&self) -> &LessonId {
        &self.id
    }

    fn state(&self) -> LessonState {
        self.state
    }

    fn unique_key(&self) -> Option<String> {
        Some(Lesson::booking_key(self.booking_id))
    }
}
