use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::failure::{ErrorCategory, FailureKind, Severity};

pub const AUTH_FAILED: &str = "loca2_auth_failed";
pub const CONNECTION_LOST: &str = "loca2_connection_lost";
pub const RATE_LIMITED: &str = "loca2_rate_limited";
pub const RECOVERY: &str = "loca2_recovery";
pub const API_DEGRADED: &str = "loca2_api_degraded";

/// Channels a successful cycle dismisses. The api-degraded channel stays.
pub const CLEARED_ON_RECOVERY: [&str; 3] = [AUTH_FAILED, CONNECTION_LOST, RATE_LIMITED];

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification sink unavailable: {0}")]
    Unavailable(String),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

impl Notification {
    pub fn new(id: &str, title: &str, message: String, severity: Severity) -> Self {
        let stamped = format!("{message}\n\nTime: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        Self {
            id: id.to_string(),
            title: title.to_string(),
            message: stamped,
            severity,
        }
    }
}

/// Host-side sink for persistent user notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn create(&self, notification: &Notification) -> Result<(), NotifyError>;
    async fn dismiss(&self, id: &str) -> Result<(), NotifyError>;
}

/// Discards everything. Useful when the host has no notification surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn create(&self, _notification: &Notification) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn dismiss(&self, _id: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Facts about a failed cycle that decide whether and what to notify.
#[derive(Debug, Clone)]
pub struct FailureNotice<'a> {
    pub category: ErrorCategory,
    pub kind: FailureKind,
    pub severity: Severity,
    pub consecutive_errors: u32,
    pub downtime: Option<Duration>,
    pub original_interval: Duration,
    pub current_interval: Duration,
    pub detail: &'a str,
}

/// Builds the user-facing notification for a failure, if its category
/// threshold is met. Severity and cooldown gating happen in `NotificationGate`.
pub fn compose_failure(notice: &FailureNotice<'_>) -> Option<Notification> {
    let detail = notice.detail;
    let severity = notice.severity;
    match (notice.category, notice.kind) {
        (ErrorCategory::Auth, _) => Some(Notification::new(
            AUTH_FAILED,
            "Loca2 Authentication Failed",
            format!(
                "Please check your Loca2 account and password. Device tracking has stopped \
                 until the credentials are fixed. Technical details: {detail}"
            ),
            severity,
        )),
        (ErrorCategory::Network, _) if notice.consecutive_errors >= 3 => {
            let minutes = notice.downtime.map(|d| d.as_secs() / 60).unwrap_or(0);
            Some(Notification::new(
                CONNECTION_LOST,
                "Loca2 Connection Issues",
                format!(
                    "Unable to reach the Loca2 API after {} consecutive attempts ({minutes} minutes \
                     of downtime). Polling continues with exponential backoff. \
                     Technical details: {detail}",
                    notice.consecutive_errors
                ),
                severity,
            ))
        }
        (_, FailureKind::RateLimit) => Some(Notification::new(
            RATE_LIMITED,
            "Loca2 Rate Limited",
            format!(
                "API rate limit exceeded. Polling interval increased from {}s to {}s. \
                 The original interval is restored once the rate limit clears. \
                 Technical details: {detail}",
                notice.original_interval.as_secs(),
                notice.current_interval.as_secs()
            ),
            severity,
        )),
        (ErrorCategory::Api, _) if notice.consecutive_errors >= 5 => Some(Notification::new(
            API_DEGRADED,
            "Loca2 API Issues",
            format!(
                "Persistent API issues after {} attempts. Device tracking may be unreliable. \
                 Technical details: {detail}",
                notice.consecutive_errors
            ),
            severity,
        )),
        _ => None,
    }
}

pub fn compose_recovery(device_count: usize) -> Notification {
    Notification::new(
        RECOVERY,
        "Loca2 Connection Restored",
        format!("Reconnected to the Loca2 API and fetched {device_count} devices."),
        Severity::Low,
    )
}

/// Per-key cooldown for failure notifications, keyed by (category, kind).
#[derive(Debug, Clone)]
pub struct NotificationGate {
    cooldown: Duration,
    last_sent: HashMap<(ErrorCategory, FailureKind), Instant>,
}

impl NotificationGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: HashMap::new(),
        }
    }

    /// True when a notification of this severity and key may go out now.
    pub fn allows(&self, key: (ErrorCategory, FailureKind), severity: Severity, now: Instant) -> bool {
        if severity < Severity::Medium {
            return false;
        }
        match self.last_sent.get(&key) {
            Some(sent) => now.saturating_duration_since(*sent) >= self.cooldown,
            None => true,
        }
    }

    pub fn record_sent(&mut self, key: (ErrorCategory, FailureKind), now: Instant) {
        self.last_sent.insert(key, now);
    }
}
