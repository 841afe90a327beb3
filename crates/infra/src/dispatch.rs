//! Notification dispatch seam.
//!
//! The engine decides *that* and *when* a reminder is sent; delivery
//! (email/push/SMS providers) sits behind [`NotificationDispatcher`].

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use lessonflow_booking::{Audience, Channel};
use lessonflow_core::{BookingId, UserId};

/// A notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundNotification {
    /// Stable across redeliveries of the same reminder.
    pub dedupe_key: String,
    pub booking_id: BookingId,
    pub recipient: UserId,
    pub audience: Audience,
    pub channel: Channel,
    pub template_key: String,
    pub send_at: DateTime<Utc>,
    /// Template variables.
    pub context: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Provider unreachable or throttled; worth retrying.
    #[error("dispatcher unavailable: {0}")]
    Unavailable(String),
    /// Provider refused the message (bad address, unknown template).
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Delivers notifications. Implementations should treat a repeated
/// `dedupe_key` as already sent.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, notification: &OutboundNotification) -> Result<(), DispatchError>;
}

/// Logs notifications instead of sending them.
#[derive(Debug, Default)]
pub struct TracingDispatcher;

impl NotificationDispatcher for TracingDispatcher {
    fn dispatch(&self, n: &OutboundNotification) -> Result<(), DispatchError> {
        info!(
            booking_id = %n.booking_id,
            recipient = %n.recipient,
            audience = n.audience.as_str(),
            channel = ?n.channel,
            template = %n.template_key,
            dedupe_key = %n.dedupe_key,
            "notification dispatched"
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Recorded {
    sent: Vec<OutboundNotification>,
    seen: HashSet<String>,
    failures_left: usize,
}

/// Records delivered notifications, dropping repeated dedupe keys.
/// Can be told to fail transiently for retry tests.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    inner: Mutex<Recorded>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` dispatch calls with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).failures_left = n;
    }

    pub fn sent(&self) -> Vec<OutboundNotification> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).sent.clone()
    }

    pub fn sent_templates(&self) -> Vec<String> {
        self.sent().into_iter().map(|n| n.template_key).collect()
    }
}

impl NotificationDispatcher for RecordingDispatcher {
    fn dispatch(&self, notification: &OutboundNotification) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.failures_left > 0 {
            inner.failures_left -= 1;
            return Err(DispatchError::Unavailable("injected failure".to_string()));
        }
        if inner.seen.insert(notification.dedupe_key.clone()) {
            inner.sent.push(notification.clone());
        }
        Ok(())
    }
}
