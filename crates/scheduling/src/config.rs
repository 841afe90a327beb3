//! Engine configuration.
//!
//! Every window, interval and retry budget the engine uses is a named field
//! here; nothing time-related is hard-coded in scheduling logic. Loaded from
//! TOML; missing fields fall back to their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use lessonflow_booking::ReminderPolicy;
use lessonflow_infra::jobs::{ActionClass, RetryPolicy};
use lessonflow_observability::LogFormat;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LESSONFLOW_CONFIG";

/// Longest window or reminder offset accepted, in minutes (one leap year).
pub const MAX_WINDOW_MINUTES: i64 = 366 * 24 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulingConfig {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub reminders: ReminderPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SchedulingConfig {
    /// Load from `$LESSONFLOW_CONFIG` if set, defaults otherwise.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject windows, intervals and budgets that would stall or break the engine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.lifecycle;
        window("lifecycle.expiry_window_minutes", l.expiry_window_minutes)?;
        window("lifecycle.auto_confirm_grace_minutes", l.auto_confirm_grace_minutes)?;
        window("lifecycle.no_show_grace_minutes", l.no_show_grace_minutes)?;
        window("lifecycle.lesson_creation_lead_minutes", l.lesson_creation_lead_minutes)?;
        window("lifecycle.completion_buffer_minutes", l.completion_buffer_minutes)?;

        let s = &self.sweep;
        window("sweep.lookahead_minutes", s.lookahead_minutes)?;
        window("sweep.completion_margin_minutes", s.completion_margin_minutes)?;
        if s.completion_margin_minutes < l.completion_buffer_minutes {
            return Err(ConfigError::Invalid(
                "sweep.completion_margin_minutes must be at least lifecycle.completion_buffer_minutes"
                    .to_string(),
            ));
        }
        if s.batch_limit == 0 {
            return Err(ConfigError::Invalid("sweep.batch_limit must be positive".to_string()));
        }

        let i = &self.intervals;
        for (name, value) in [
            ("intervals.sweep_secs", i.sweep_secs),
            ("intervals.poll_millis", i.poll_millis),
            ("intervals.lease_secs", i.lease_secs),
            ("intervals.lease_reaper_secs", i.lease_reaper_secs),
            ("intervals.status_report_secs", i.status_report_secs),
            ("executor.job_timeout_secs", self.executor.job_timeout_secs),
            ("executor.lock_timeout_millis", self.executor.lock_timeout_millis),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if i.lease_secs <= self.executor.job_timeout_secs {
            return Err(ConfigError::Invalid(
                "intervals.lease_secs must exceed executor.job_timeout_secs".to_string(),
            ));
        }

        let r = &self.retry;
        for (name, value) in [
            ("retry.critical_attempts", r.critical_attempts),
            ("retry.check_attempts", r.check_attempts),
            ("retry.reminder_attempts", r.reminder_attempts),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if self.executor.workers == 0 {
            return Err(ConfigError::Invalid("executor.workers must be at least 1".to_string()));
        }
        let retain = self.executor.retain_finished_hours;
        if retain <= 0 || retain > MAX_WINDOW_MINUTES / 60 {
            return Err(ConfigError::Invalid(format!(
                "executor.retain_finished_hours must be between 1 and {}",
                MAX_WINDOW_MINUTES / 60
            )));
        }

        let reminders = &self.reminders;
        for (table, specs) in [
            ("reminders.lesson_start", &reminders.lesson_start),
            ("reminders.booking_expiry", &reminders.booking_expiry),
            ("reminders.lesson_completed", &reminders.lesson_completed),
        ] {
            for spec in specs {
                let offset = spec.offset_before_trigger.minutes();
                if offset.unsigned_abs() > MAX_WINDOW_MINUTES.unsigned_abs() {
                    return Err(ConfigError::Invalid(format!(
                        "{table}: offset {offset} ({}) exceeds {MAX_WINDOW_MINUTES} minutes",
                        spec.template_key
                    )));
                }
            }
        }
        Ok(())
    }
}

fn window(name: &str, minutes: i64) -> Result<(), ConfigError> {
    if minutes <= 0 {
        return Err(ConfigError::Invalid(format!("{name} must be positive")));
    }
    if minutes > MAX_WINDOW_MINUTES {
        return Err(ConfigError::Invalid(format!(
            "{name} must be at most {MAX_WINDOW_MINUTES} minutes"
        )));
    }
    Ok(())
}

/// Lifecycle windows, in minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Pending bookings expire this long after creation.
    #[serde(default = "default_expiry_window")]
    pub expiry_window_minutes: i64,
    /// Instant-confirm bookings are confirmed this long after creation.
    #[serde(default = "default_auto_confirm_grace")]
    pub auto_confirm_grace_minutes: i64,
    /// A confirmed booking without a lesson this long after its start is a no-show.
    #[serde(default = "default_no_show_grace")]
    pub no_show_grace_minutes: i64,
    /// Lessons are materialised this long before the session.
    #[serde(default = "default_lesson_creation_lead")]
    pub lesson_creation_lead_minutes: i64,
    /// Lessons complete this long after their scheduled end.
    #[serde(default = "default_completion_buffer")]
    pub completion_buffer_minutes: i64,
}

fn default_expiry_window() -> i64 { 48 * 60 }
fn default_auto_confirm_grace() -> i64 { 5 }
fn default_no_show_grace() -> i64 { 30 }
fn default_lesson_creation_lead() -> i64 { 24 * 60 }
fn default_completion_buffer() -> i64 { 15 }

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            expiry_window_minutes: default_expiry_window(),
            auto_confirm_grace_minutes: default_auto_confirm_grace(),
            no_show_grace_minutes: default_no_show_grace(),
            lesson_creation_lead_minutes: default_lesson_creation_lead(),
            completion_buffer_minutes: default_completion_buffer(),
        }
    }
}

impl LifecycleConfig {
    pub fn expiry_window(&self) -> Duration {
        Duration::minutes(self.expiry_window_minutes)
    }

    pub fn auto_confirm_grace(&self) -> Duration {
        Duration::minutes(self.auto_confirm_grace_minutes)
    }

    pub fn no_show_grace(&self) -> Duration {
        Duration::minutes(self.no_show_grace_minutes)
    }

    pub fn lesson_creation_lead(&self) -> Duration {
        Duration::minutes(self.lesson_creation_lead_minutes)
    }

    pub fn completion_buffer(&self) -> Duration {
        Duration::minutes(self.completion_buffer_minutes)
    }
}

/// Reconciliation sweep windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Lessons are created for confirmed bookings starting within this window.
    #[serde(default = "default_lookahead")]
    pub lookahead_minutes: i64,
    /// In-progress lessons are force-completed this long after their end.
    #[serde(default = "default_completion_margin")]
    pub completion_margin_minutes: i64,
    /// Entities read per scan page; every step reads pages until none are left.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

fn default_lookahead() -> i64 { 24 * 60 }
fn default_completion_margin() -> i64 { 2 * 60 }
fn default_batch_limit() -> usize { 500 }

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            lookahead_minutes: default_lookahead(),
            completion_margin_minutes: default_completion_margin(),
            batch_limit: default_batch_limit(),
        }
    }
}

impl SweepConfig {
    pub fn lookahead(&self) -> Duration {
        Duration::minutes(self.lookahead_minutes)
    }

    pub fn completion_margin(&self) -> Duration {
        Duration::minutes(self.completion_margin_minutes)
    }
}

/// Periodic task cadences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalsConfig {
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
    #[serde(default = "default_poll_millis")]
    pub poll_millis: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_lease_reaper_secs")]
    pub lease_reaper_secs: u64,
    #[serde(default = "default_status_report_secs")]
    pub status_report_secs: u64,
}

fn default_sweep_secs() -> u64 { 5 * 60 }
fn default_poll_millis() -> u64 { 500 }
fn default_lease_secs() -> u64 { 120 }
fn default_lease_reaper_secs() -> u64 { 30 }
fn default_status_report_secs() -> u64 { 60 }

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            sweep_secs: default_sweep_secs(),
            poll_millis: default_poll_millis(),
            lease_secs: default_lease_secs(),
            lease_reaper_secs: default_lease_reaper_secs(),
            status_report_secs: default_status_report_secs(),
        }
    }
}

impl IntervalsConfig {
    pub fn sweep(&self) -> StdDuration {
        StdDuration::from_secs(self.sweep_secs)
    }

    pub fn poll(&self) -> StdDuration {
        StdDuration::from_millis(self.poll_millis)
    }

    pub fn lease(&self) -> StdDuration {
        StdDuration::from_secs(self.lease_secs)
    }

    pub fn lease_reaper(&self) -> StdDuration {
        StdDuration::from_secs(self.lease_reaper_secs)
    }

    pub fn status_report(&self) -> StdDuration {
        StdDuration::from_secs(self.status_report_secs)
    }
}

/// Attempt budgets per action class (total attempts, not retries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_critical_attempts")]
    pub critical_attempts: u32,
    #[serde(default = "default_check_attempts")]
    pub check_attempts: u32,
    #[serde(default = "default_reminder_attempts")]
    pub reminder_attempts: u32,
    #[serde(default = "default_base_delay_millis")]
    pub base_delay_millis: u64,
    #[serde(default = "default_max_delay_millis")]
    pub max_delay_millis: u64,
}

fn default_critical_attempts() -> u32 { 3 }
fn default_check_attempts() -> u32 { 2 }
fn default_reminder_attempts() -> u32 { 1 }
fn default_base_delay_millis() -> u64 { 1_000 }
fn default_max_delay_millis() -> u64 { 5 * 60 * 1_000 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            critical_attempts: default_critical_attempts(),
            check_attempts: default_check_attempts(),
            reminder_attempts: default_reminder_attempts(),
            base_delay_millis: default_base_delay_millis(),
            max_delay_millis: default_max_delay_millis(),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff policy for a class of action.
    pub fn policy_for(&self, class: ActionClass) -> RetryPolicy {
        let attempts = match class {
            ActionClass::Critical => self.critical_attempts,
            ActionClass::Check => self.check_attempts,
            ActionClass::Reminder => self.reminder_attempts,
        };
        RetryPolicy::exponential(
            attempts,
            StdDuration::from_millis(self.base_delay_millis),
            StdDuration::from_millis(self.max_delay_millis),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_lock_timeout_millis")]
    pub lock_timeout_millis: u64,
    /// Finished jobs are kept this long for inspection.
    #[serde(default = "default_retain_finished_hours")]
    pub retain_finished_hours: i64,
}

fn default_workers() -> usize { 2 }
fn default_job_timeout_secs() -> u64 { 30 }
fn default_lock_timeout_millis() -> u64 { 2_000 }
fn default_retain_finished_hours() -> i64 { 24 }

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            job_timeout_secs: default_job_timeout_secs(),
            lock_timeout_millis: default_lock_timeout_millis(),
            retain_finished_hours: default_retain_finished_hours(),
        }
    }
}

impl ExecutorSettings {
    pub fn job_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.job_timeout_secs)
    }

    pub fn lock_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.lock_timeout_millis)
    }

    pub fn retain_finished(&self) -> Duration {
        Duration::hours(self.retain_finished_hours)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}
