use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    #[serde(rename = "authentication")]
    Auth,
    Network,
    Api,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 4] = [Self::Auth, Self::Network, Self::Api, Self::Unknown];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "authentication",
            Self::Network => "network",
            Self::Api => "api",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subtype within a category; together they form the notification key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Authentication,
    RateLimit,
    ConnectionError,
    ApiError,
    Unexpected,
    LocationFetch,
    LocationFetchUnexpected,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::ConnectionError => "connection_error",
            Self::ApiError => "api_error",
            Self::Unexpected => "unexpected",
            Self::LocationFetch => "location_fetch",
            Self::LocationFetchUnexpected => "location_fetch_unexpected",
        }
    }

    fn headline(self) -> &'static str {
        match self {
            Self::Authentication => "authentication failed",
            Self::RateLimit => "rate limit exceeded",
            Self::ConnectionError => "connection error",
            Self::ApiError => "api error",
            Self::Unexpected => "unexpected error",
            Self::LocationFetch | Self::LocationFetchUnexpected => "location fetch failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub category: ErrorCategory,
    pub kind: FailureKind,
    pub message: String,
    pub duration_secs: f64,
    pub context: Option<String>,
    pub consecutive_errors: u32,
    pub recovery_attempts: u32,
    pub severity: Severity,
}

/// Caller-visible result of a failed update cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{} ({}/{}, severity {}): {}", .kind.headline(), .category, .kind, .severity, .message)]
pub struct UpdateFailed {
    pub category: ErrorCategory,
    pub kind: FailureKind,
    pub severity: Severity,
    pub message: String,
    pub retry_after: Option<Duration>,
}

pub fn classify(err: &ApiError) -> (ErrorCategory, FailureKind) {
    match err {
        ApiError::Auth(_) => (ErrorCategory::Auth, FailureKind::Authentication),
        ApiError::RateLimited { .. } => (ErrorCategory::Api, FailureKind::RateLimit),
        ApiError::Connection(_) => (ErrorCategory::Network, FailureKind::ConnectionError),
        ApiError::Api { .. } => (ErrorCategory::Api, FailureKind::ApiError),
        ApiError::Unexpected(_) => (ErrorCategory::Unknown, FailureKind::Unexpected),
    }
}

pub fn determine_severity(category: ErrorCategory, kind: FailureKind, consecutive: u32) -> Severity {
    if category == ErrorCategory::Auth || consecutive >= 10 {
        return Severity::Critical;
    }
    if category == ErrorCategory::Network && consecutive >= 5 {
        return Severity::High;
    }
    if kind == FailureKind::RateLimit && consecutive >= 3 {
        return Severity::High;
    }
    match category {
        ErrorCategory::Api | ErrorCategory::Network => Severity::Medium,
        _ => Severity::Low,
    }
}
