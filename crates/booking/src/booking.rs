use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use lessonflow_core::lifecycle::rejected;
use lessonflow_core::{BookingId, DomainError, DomainResult, Entity, Lifecycle, UserId};

/// Longest bookable session.
pub const MAX_DURATION_MINUTES: u32 = 8 * 60;

/// Booking status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingState {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

/// Edges of the booking state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingTransition {
    Confirm,
    Complete,
    Expire,
    Cancel,
    NoShow,
}

impl BookingTransition {
    pub const ALL: [BookingTransition; 5] = [
        BookingTransition::Confirm,
        BookingTransition::Complete,
        BookingTransition::Expire,
        BookingTransition::Cancel,
        BookingTransition::NoShow,
    ];

    /// Why the booking ended up cancelled, for transitions that cancel it.
    pub fn cancellation_reason(self) -> Option<CancellationReason> {
        match self {
            BookingTransition::Expire => Some(CancellationReason::Expired),
            BookingTransition::NoShow => Some(CancellationReason::NoShow),
            BookingTransition::Cancel => Some(CancellationReason::Cancelled),
            BookingTransition::Confirm | BookingTransition::Complete => None,
        }
    }
}

impl BookingState {
    pub const ALL: [BookingState; 4] = [
        BookingState::Pending,
        BookingState::Confirmed,
        BookingState::Completed,
        BookingState::Cancelled,
    ];
}

impl Lifecycle for BookingState {
    type Transition = BookingTransition;

    fn next(self, transition: BookingTransition) -> DomainResult<Self> {
        use BookingState::*;
        use BookingTransition::*;

        match (self, transition) {
            (Pending, Confirm) => Ok(Confirmed),
            (Pending, Expire) | (Pending, Cancel) => Ok(Cancelled),
            (Confirmed, Complete) => Ok(Completed),
            (Confirmed, Cancel) | (Confirmed, NoShow) => Ok(Cancelled),
            (Pending, Complete | NoShow)
            | (Confirmed, Confirm | Expire)
            | (Completed, _)
            | (Cancelled, _) => Err(rejected(self, transition)),
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, BookingState::Completed | BookingState::Cancelled)
    }
}

/// Why a booking was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// Nobody confirmed the request in time.
    Expired,
    /// The session time passed without a lesson taking place.
    NoShow,
    /// A participant cancelled.
    Cancelled,
}

/// Input for creating a booking (as committed by the booking flow).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBooking {
    pub id: BookingId,
    pub student_id: UserId,
    pub tutor_id: UserId,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
    /// The tutor accepts bookings without manual confirmation.
    pub instant_confirm: bool,
    pub created_at: DateTime<Utc>,
}

/// Booking entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    id: BookingId,
    state: BookingState,
    student_id: UserId,
    tutor_id: UserId,
    scheduled_at: DateTime<Utc>,
    duration_minutes: u32,
    instant_confirm: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    cancellation: Option<CancellationReason>,
}

impl Booking {
    /// Create a booking in `Pending`.
    pub fn create(new: NewBooking) -> DomainResult<Self> {
        validate_duration(new.duration_minutes)?;
        if new.student_id == new.tutor_id {
            return Err(DomainError::validation("student and tutor must differ"));
        }

        Ok(Self {
            id: new.id,
            state: BookingState::Pending,
            student_id: new.student_id,
            tutor_id: new.tutor_id,
            scheduled_at: new.scheduled_at,
            duration_minutes: new.duration_minutes,
            instant_confirm: new.instant_confirm,
            created_at: new.created_at,
            updated_at: new.created_at,
            cancellation: None,
        })
    }

    pub fn id_typed(&self) -> BookingId {
        self.id
    }

    pub fn student_id(&self) -> UserId {
        self.student_id
    }

    pub fn tutor_id(&self) -> UserId {
        self.tutor_id
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.duration_minutes))
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.scheduled_at + self.duration()
    }

    pub fn instant_confirm(&self) -> bool {
        self.instant_confirm
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn cancellation(&self) -> Option<CancellationReason> {
        self.cancellation
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply one transition from the table.
    pub fn apply(&mut self, transition: BookingTransition, at: DateTime<Utc>) -> DomainResult<()> {
        let next = self.state.next(transition)?;
        self.state = next;
        if next == BookingState::Cancelled {
            self.cancellation = transition.cancellation_reason();
        }
        self.updated_at = at;
        Ok(())
    }

    /// Move the session to a new time. Terminal bookings cannot be moved.
    pub fn reschedule(
        &mut self,
        scheduled_at: DateTime<Utc>,
        duration_minutes: u32,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::invariant(format!(
                "cannot reschedule a {:?} booking",
                self.state
            )));
        }
        validate_duration(duration_minutes)?;
        self.scheduled_at = scheduled_at;
        self.duration_minutes = duration_minutes;
        self.updated_at = at;
        Ok(())
    }
}

impl Entity for Booking {
    type Id = BookingId;
    type State = BookingState;

    fn id(&self) -> &BookingId {
        &self.id
    }

    fn state(&self) -> BookingState {
        self.state
    }
}

pub(crate) fn validate_duration(minutes: u32) -> DomainResult<()> {
    if minutes == 0 {
        return Err(DomainError::validation("duration must be positive"));
    }
    if minutes > MAX_DURATION_MINUTES {
        return Err(DomainError::validation(format!(
            "duration must not exceed {MAX_DURATION_MINUTES} minutes"
        )));
    }
    Ok(())
}
