//! Periodic reconciliation sweep.
//!
//! The job path is the primary driver of lifecycle transitions; the sweep
//! catches whatever it missed (lost jobs, crashes between a transition and
//! its follow-up planning, clock skew). Corrections go through the same
//! [`Transitions`] as the job path, so a sweep racing an executor can never
//! apply a transition twice.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use lessonflow_booking::{Booking, BookingState, Lesson, LessonState};
use lessonflow_core::{Entity, SharedClock};
use lessonflow_infra::{Repository, StoreError};

use crate::config::SweepConfig;
use crate::error::SchedulingResult;
use crate::orchestrator::SchedulingOrchestrator;
use crate::transitions::Transitions;

/// Corrections applied by one sweep, per step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub started_at: Option<DateTime<Utc>>,
    pub expired: usize,
    pub no_shows: usize,
    pub orphans_cancelled: usize,
    pub lessons_created: usize,
    pub lessons_started: usize,
    pub lessons_completed: usize,
    pub bookings_completed: usize,
    /// Entities whose correction failed; the sweep moved on.
    pub errors: usize,
}

impl SweepReport {
    pub fn corrections(&self) -> usize {
        self.expired
            + self.no_shows
            + self.orphans_cancelled
            + self.lessons_created
            + self.lessons_started
            + self.lessons_completed
            + self.bookings_completed
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationSweep {
    orchestrator: SchedulingOrchestrator,
    config: SweepConfig,
}

impl ReconciliationSweep {
    pub fn new(orchestrator: SchedulingOrchestrator, config: SweepConfig) -> Self {
        Self { orchestrator, config }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Sweep at the orchestrator clock's current time.
    pub fn run(&self) -> SweepReport {
        let clock: &SharedClock = self.orchestrator.clock();
        self.sweep(clock.now())
    }

    /// Bring every entity whose deadline has passed at `now` into the state
    /// the job path would have left it in.
    ///
    /// Steps run in dependency order, so a second sweep at the same `now`
    /// finds nothing to do.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            started_at: Some(now),
            ..SweepReport::default()
        };

        self.expire_pending(now, &mut report);
        self.mark_no_shows(now, &mut report);
        self.cancel_orphan_lessons(now, &mut report);
        self.create_missing_lessons(now, &mut report);
        self.start_due_lessons(now, &mut report);
        self.complete_overdue_lessons(now, &mut report);
        self.complete_finished_bookings(now, &mut report);

        if report.corrections() > 0 || report.errors > 0 {
            info!(
                expired = report.expired,
                no_shows = report.no_shows,
                orphans_cancelled = report.orphans_cancelled,
                lessons_created = report.lessons_created,
                lessons_started = report.lessons_started,
                lessons_completed = report.lessons_completed,
                bookings_completed = report.bookings_completed,
                errors = report.errors,
                "reconciliation sweep applied corrections"
            );
        } else {
            debug!("reconciliation sweep found nothing to correct");
        }
        report
    }

    fn transitions(&self) -> &Transitions {
        self.orchestrator.transitions()
    }

    fn expire_pending(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let lifecycle = self.orchestrator.lifecycle();
        let filter = |b: &Booking| b.state() == BookingState::Pending && lifecycle.expiry_deadline(b) <= now;
        for page in self.bookings(&filter) {
            let Some(due) = read_page(page, "expire", &mut report.errors) else { break };
            correct_each(&due, "expire", &mut report.expired, &mut report.errors, |b| {
                discrepancy("expire", b, "pending booking past its expiry deadline");
                let booking = self.transitions().expire_booking(b.id_typed(), now)?;
                self.orchestrator.replan_booking(&booking, now)?;
                Ok(true)
            });
        }
    }

    fn mark_no_shows(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let lifecycle = self.orchestrator.lifecycle();
        let filter = |b: &Booking| b.state() == BookingState::Confirmed && lifecycle.no_show_deadline(b) <= now;
        for page in self.bookings(&filter) {
            let Some(due) = read_page(page, "no_show", &mut report.errors) else { break };
            correct_each(&due, "no_show", &mut report.no_shows, &mut report.errors, |b| {
                if self.transitions().live_lesson_for(b.id_typed())?.is_some() {
                    return Ok(false);
                }
                discrepancy("no_show", b, "confirmed booking past its no-show deadline without a lesson");
                let booking = self.transitions().no_show(b.id_typed(), Some(b.scheduled_at()), now)?;
                self.orchestrator.replan_booking(&booking, now)?;
                Ok(true)
            });
        }
    }

    fn cancel_orphan_lessons(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let filter = |l: &Lesson| !l.is_terminal();
        for page in self.lessons(&filter) {
            let Some(open) = read_page(page, "orphans", &mut report.errors) else { break };
            correct_each(&open, "orphans", &mut report.orphans_cancelled, &mut report.errors, |l| {
                let booking = self.transitions().store().bookings.get(&l.booking_id())?;
                if booking.is_some_and(|b| b.state() != BookingState::Cancelled) {
                    return Ok(false);
                }
                discrepancy("orphans", l, "open lesson without a live booking");
                self.orchestrator.lifecycle().cancel_lesson_jobs(l.id_typed(), now)?;
                Ok(self.transitions().cancel_lesson(l.id_typed(), now)?.is_some())
            });
        }
    }

    fn create_missing_lessons(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let lifecycle = self.orchestrator.lifecycle();
        let horizon = now + self.config.lookahead();
        let filter = |b: &Booking| {
            b.state() == BookingState::Confirmed
                && b.scheduled_at() <= horizon
                && now < lifecycle.no_show_deadline(b)
        };
        for page in self.bookings(&filter) {
            let Some(due) = read_page(page, "create_lesson", &mut report.errors) else { break };
            correct_each(&due, "create_lesson", &mut report.lessons_created, &mut report.errors, |b| {
                if self.transitions().store().lesson_for_booking(b.id_typed())?.is_some() {
                    return Ok(false);
                }
                discrepancy("create_lesson", b, "confirmed booking inside the creation window without a lesson");
                let lesson = self.transitions().create_lesson(b.id_typed(), Some(b.scheduled_at()), now)?;
                self.orchestrator.plan_booking_lifecycle(b, true, now)?;
                self.orchestrator.replan_lesson(&lesson, now)?;
                Ok(true)
            });
        }
    }

    fn start_due_lessons(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let filter = |l: &Lesson| l.state() == LessonState::Scheduled && l.scheduled_at() <= now;
        for page in self.lessons(&filter) {
            let Some(due) = read_page(page, "start", &mut report.errors) else { break };
            correct_each(&due, "start", &mut report.lessons_started, &mut report.errors, |l| {
                discrepancy("start", l, "scheduled lesson past its start time");
                let lesson = self.transitions().start_lesson(l.id_typed(), Some(l.scheduled_at()), now)?;
                self.orchestrator.replan_lesson(&lesson, now)?;
                Ok(true)
            });
        }
    }

    fn complete_overdue_lessons(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let margin = self.config.completion_margin();
        // Fresh scan: picks up lessons started by the previous step.
        let filter = |l: &Lesson| l.state() == LessonState::InProgress && l.ends_at() + margin <= now;
        let mut bookings_completed = 0;
        for page in self.lessons(&filter) {
            let Some(due) = read_page(page, "complete_lesson", &mut report.errors) else { break };
            correct_each(&due, "complete_lesson", &mut report.lessons_completed, &mut report.errors, |l| {
                discrepancy("complete_lesson", l, "in-progress lesson past its completion margin");
                let lesson = self.transitions().complete_lesson(l.id_typed(), Some(l.scheduled_at()), now)?;
                if self.orchestrator.after_lesson_completed(&lesson, now)? {
                    bookings_completed += 1;
                }
                Ok(true)
            });
        }
        report.bookings_completed += bookings_completed;
    }

    fn complete_finished_bookings(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let filter = |b: &Booking| b.state() == BookingState::Confirmed;
        for page in self.bookings(&filter) {
            let Some(confirmed) = read_page(page, "complete_booking", &mut report.errors) else { break };
            correct_each(
                &confirmed,
                "complete_booking",
                &mut report.bookings_completed,
                &mut report.errors,
                |b| {
                    let lesson = match self.transitions().store().lesson_for_booking(b.id_typed())? {
                        Some(lesson) if lesson.state() == LessonState::Completed => lesson,
                        _ => return Ok(false),
                    };
                    discrepancy("complete_booking", b, "confirmed booking whose lesson already completed");
                    self.orchestrator.after_lesson_completed(&lesson, now)
                },
            );
        }
    }

    fn bookings<'a>(&'a self, filter: &'a dyn Fn(&Booking) -> bool) -> Pages<'a, Booking> {
        Pages::new(&*self.transitions().store().bookings, filter, self.config.batch_limit)
    }

    fn lessons<'a>(&'a self, filter: &'a dyn Fn(&Lesson) -> bool) -> Pages<'a, Lesson> {
        Pages::new(&*self.transitions().store().lessons, filter, self.config.batch_limit)
    }
}

/// Every entity matching a filter, read one id-ordered page at a time.
///
/// Entities are corrected page by page; a correction never changes an id,
/// so the cursor neither skips nor repeats anything.
struct Pages<'a, T: Entity> {
    repo: &'a dyn Repository<T>,
    filter: &'a dyn Fn(&T) -> bool,
    size: usize,
    after: Option<T::Id>,
    done: bool,
}

impl<'a, T: Entity> Pages<'a, T> {
    fn new(repo: &'a dyn Repository<T>, filter: &'a dyn Fn(&T) -> bool, size: usize) -> Self {
        Self {
            repo,
            filter,
            size: size.max(1),
            after: None,
            done: false,
        }
    }
}

impl<T: Entity> Iterator for Pages<'_, T> {
    type Item = Result<Vec<T>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let page = match self.repo.scan(self.after.as_ref(), self.filter, self.size) {
            Ok(page) => page,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        match page.last() {
            Some(last) if page.len() == self.size => self.after = Some(*last.id()),
            _ => self.done = true,
        }
        if page.is_empty() { None } else { Some(Ok(page)) }
    }
}

/// Unwrap one page, counting a failed read against the sweep.
fn read_page<T>(page: Result<Vec<T>, StoreError>, step: &'static str, errors: &mut usize) -> Option<Vec<T>> {
    match page {
        Ok(page) => Some(page),
        Err(err) => {
            *errors += 1;
            error!(step, error = %err, "sweep scan failed");
            None
        }
    }
}

/// Apply `fix` to every entity. A lost race is not an error; anything else
/// is counted and the sweep moves on.
fn correct_each<T, F>(items: &[T], step: &'static str, corrected: &mut usize, errors: &mut usize, mut fix: F)
where
    T: Entity,
    F: FnMut(&T) -> SchedulingResult<bool>,
{
    for item in items {
        match fix(item) {
            Ok(true) => *corrected += 1,
            Ok(false) => {}
            Err(err) if err.is_mismatch() => {
                debug!(step, id = %item.id(), reason = %err, "sweep correction raced, skipped");
            }
            Err(err) => {
                *errors += 1;
                error!(step, id = %item.id(), error = %err, "sweep correction failed");
            }
        }
    }
}

fn discrepancy<T: Entity>(step: &'static str, entity: &T, what: &str) {
    warn!(step, id = %entity.id(), state = ?entity.state(), "{what}");
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::{Duration, TimeZone};
    use lessonflow_booking::{BookingTransition, LessonTransition, NewBooking, ReminderPlanner};
    use lessonflow_core::{BookingId, LessonId, ManualClock, UserId};
    use lessonflow_infra::EntityStore;
    use lessonflow_infra::jobs::InMemoryJobStore;

    use crate::config::{LifecycleConfig, RetryConfig};
    use crate::lifecycle::LifecycleScheduler;
    use crate::notifications::NotificationScheduler;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn sweep() -> (EntityStore, ReconciliationSweep) {
        sweep_with(SweepConfig::default())
    }

    fn sweep_with(config: SweepConfig) -> (EntityStore, ReconciliationSweep) {
        let jobs = InMemoryJobStore::arc();
        let store = EntityStore::in_memory();
        let orchestrator = SchedulingOrchestrator::new(
            Transitions::new(store.clone()),
            LifecycleScheduler::new(jobs.clone(), LifecycleConfig::default(), RetryConfig::default()),
            NotificationScheduler::new(jobs, ReminderPlanner::default(), RetryConfig::default()),
            ManualClock::arc(t0()),
        );
        (store.clone(), ReconciliationSweep::new(orchestrator, config))
    }

    fn insert(store: &EntityStore, scheduled_in: Duration, confirm: bool) -> Booking {
        let mut booking = Booking::create(NewBooking {
            id: BookingId::new(),
            student_id: UserId::new(),
            tutor_id: UserId::new(),
            scheduled_at: t0() + scheduled_in,
            duration_minutes: 60,
            instant_confirm: false,
            created_at: t0(),
        })
        .unwrap();
        if confirm {
            booking.apply(BookingTransition::Confirm, t0()).unwrap();
        }
        store.bookings.insert(booking.clone()).unwrap();
        booking
    }

    fn state(store: &EntityStore, booking: &Booking) -> BookingState {
        store.bookings.get(&booking.id_typed()).unwrap().unwrap().state()
    }

    #[test]
    fn expires_stale_pending_bookings() {
        let (store, sweep) = sweep();
        let stale = insert(&store, Duration::days(5), false);
        let fresh = insert(&store, Duration::days(5), false);
        store
            .bookings
            .compare_and_transition(&fresh.id_typed(), BookingState::Pending, &|b: &mut Booking| {
                b.apply(BookingTransition::Confirm, t0())
            })
            .unwrap();

        let report = sweep.sweep(t0() + Duration::hours(48));
        assert_eq!(report.expired, 1);
        assert_eq!(state(&store, &stale), BookingState::Cancelled);
        assert_eq!(state(&store, &fresh), BookingState::Confirmed);
    }

    #[test]
    fn no_show_after_grace_without_lesson() {
        let (store, sweep) = sweep();
        let booking = insert(&store, Duration::hours(2), true);

        let report = sweep.sweep(t0() + Duration::hours(2) + Duration::minutes(30));
        assert_eq!(report.no_shows, 1);
        assert_eq!(state(&store, &booking), BookingState::Cancelled);
    }

    #[test]
    fn materialises_starts_and_completes_lessons() {
        let (store, sweep) = sweep();
        let booking = insert(&store, Duration::hours(2), true);

        let report = sweep.sweep(t0());
        assert_eq!(report.lessons_created, 1);
        let lesson = store.lesson_for_booking(booking.id_typed()).unwrap().unwrap();
        assert_eq!(lesson.state(), LessonState::Scheduled);

        let report = sweep.sweep(t0() + Duration::hours(2));
        assert_eq!(report.lessons_started, 1);

        // ends at +3h, completion margin 2h
        let report = sweep.sweep(t0() + Duration::hours(5));
        assert_eq!(report.lessons_completed, 1);
        assert_eq!(report.bookings_completed, 1);
        assert_eq!(state(&store, &booking), BookingState::Completed);
    }

    #[test]
    fn lessons_outside_lookahead_wait() {
        let (store, sweep) = sweep();
        let booking = insert(&store, Duration::hours(30), true);
        assert_eq!(sweep.sweep(t0()).lessons_created, 0);
        assert!(store.lesson_for_booking(booking.id_typed()).unwrap().is_none());
    }

    #[test]
    fn cancels_lessons_of_cancelled_bookings() {
        let (store, sweep) = sweep();
        let booking = insert(&store, Duration::hours(2), true);
        sweep.sweep(t0());
        store
            .bookings
            .compare_and_transition(&booking.id_typed(), BookingState::Confirmed, &|b: &mut Booking| {
                b.apply(BookingTransition::Cancel, t0())
            })
            .unwrap();

        let report = sweep.sweep(t0() + Duration::minutes(5));
        assert_eq!(report.orphans_cancelled, 1);
        let lesson = store.lesson_for_booking(booking.id_typed()).unwrap().unwrap();
        assert_eq!(lesson.state(), LessonState::Cancelled);
    }

    #[test]
    fn completes_bookings_behind_completed_lessons() {
        let (store, sweep) = sweep();
        let booking = insert(&store, Duration::hours(2), true);
        sweep.sweep(t0());
        let lesson = store.lesson_for_booking(booking.id_typed()).unwrap().unwrap();
        for (from, t) in [
            (LessonState::Scheduled, LessonTransition::Start),
            (LessonState::InProgress, LessonTransition::Complete),
        ] {
            store
                .lessons
                .compare_and_transition(&lesson.id_typed(), from, &|l: &mut Lesson| {
                    l.apply(t, t0() + Duration::hours(2))
                })
                .unwrap();
        }

        let report = sweep.sweep(t0() + Duration::hours(3));
        assert_eq!(report.bookings_completed, 1);
        assert_eq!(state(&store, &booking), BookingState::Completed);
    }

    #[test]
    fn second_sweep_is_a_fixed_point() {
        let (store, sweep) = sweep();
        insert(&store, Duration::days(5), false);
        insert(&store, Duration::hours(1), true);
        insert(&store, Duration::hours(20), true);
        insert(&store, Duration::hours(2), true);

        let now = t0() + Duration::hours(50);
        let first = sweep.sweep(now);
        assert!(first.corrections() > 0);
        assert_eq!(first.errors, 0);

        let second = sweep.sweep(now);
        assert_eq!(second.corrections(), 0);
        assert_eq!(second.errors, 0);
    }

    fn small_pages(batch_limit: usize) -> SweepConfig {
        SweepConfig {
            batch_limit,
            ..SweepConfig::default()
        }
    }

    #[test]
    fn rows_needing_no_correction_do_not_hide_later_ones() {
        let (store, sweep) = sweep_with(small_pages(2));
        for _ in 0..3 {
            let booking = insert(&store, Duration::hours(2), true);
            let lesson = Lesson::from_booking(LessonId::new(), &booking, t0()).unwrap();
            store.lessons.insert(lesson).unwrap();
        }
        let lost = insert(&store, Duration::hours(2), true);

        let report = sweep.sweep(t0() + Duration::hours(2) + Duration::minutes(30));
        assert_eq!(report.no_shows, 1);
        assert_eq!(report.lessons_started, 3);
        assert_eq!(report.errors, 0);
        assert_eq!(state(&store, &lost), BookingState::Cancelled);
    }

    #[test]
    fn orphans_behind_healthy_lessons_are_found() {
        let (store, sweep) = sweep_with(small_pages(2));
        for _ in 0..3 {
            let booking = insert(&store, Duration::hours(6), true);
            let lesson = Lesson::from_booking(LessonId::new(), &booking, t0()).unwrap();
            store.lessons.insert(lesson).unwrap();
        }
        let cancelled = insert(&store, Duration::hours(6), true);
        let lesson = Lesson::from_booking(LessonId::new(), &cancelled, t0()).unwrap();
        store.lessons.insert(lesson).unwrap();
        store
            .bookings
            .compare_and_transition(&cancelled.id_typed(), BookingState::Confirmed, &|b: &mut Booking| {
                b.apply(BookingTransition::Cancel, t0())
            })
            .unwrap();

        let report = sweep.sweep(t0());
        assert_eq!(report.orphans_cancelled, 1);
        let lesson = store.lesson_for_booking(cancelled.id_typed()).unwrap().unwrap();
        assert_eq!(lesson.state(), LessonState::Cancelled);
    }

    #[test]
    fn far_off_confirmed_bookings_do_not_hide_a_finished_one() {
        let (store, sweep) = sweep_with(small_pages(2));
        for _ in 0..3 {
            insert(&store, Duration::days(30), true);
        }
        let booking = insert(&store, Duration::hours(2), true);
        let mut lesson = Lesson::from_booking(LessonId::new(), &booking, t0()).unwrap();
        lesson.apply(LessonTransition::Start, t0() + Duration::hours(2)).unwrap();
        lesson.apply(LessonTransition::Complete, t0() + Duration::hours(3)).unwrap();
        store.lessons.insert(lesson).unwrap();

        let report = sweep.sweep(t0() + Duration::hours(3));
        assert_eq!(report.bookings_completed, 1);
        assert_eq!(state(&store, &booking), BookingState::Completed);
    }

    #[test]
    fn more_due_rows_than_one_page_are_all_corrected_in_one_sweep() {
        let (store, sweep) = sweep_with(small_pages(3));
        let stale: Vec<_> = (0..4).map(|_| insert(&store, Duration::days(5), false)).collect();

        let now = t0() + Duration::hours(48);
        let first = sweep.sweep(now);
        assert_eq!(first.expired, 4);
        for booking in &stale {
            assert_eq!(state(&store, booking), BookingState::Cancelled);
        }

        let second = sweep.sweep(now);
        assert_eq!(second.corrections(), 0);
        assert_eq!(second.errors, 0);
    }
}
