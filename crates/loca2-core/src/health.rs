use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::ErrorRecord;

const DAY_SECS: f64 = 24.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors recorded strictly after `now - period`.
pub fn errors_within<'a, I>(history: I, now: DateTime<Utc>, period: Duration) -> usize
where
    I: IntoIterator<Item = &'a ErrorRecord>,
{
    let cutoff = now - chrono_span(period);
    history.into_iter().filter(|e| e.timestamp > cutoff).count()
}

/// Error count over the trailing period. Reported as a plain count, so the
/// one hour figure doubles as "errors per hour".
pub fn error_rate_for_period<'a, I>(history: I, now: DateTime<Utc>, period: Duration) -> f64
where
    I: IntoIterator<Item = &'a ErrorRecord>,
{
    errors_within(history, now, period) as f64
}

/// Estimated availability over the last 24 hours, in percent. Each recorded
/// error is charged one full scan interval of downtime.
pub fn availability<'a, I>(history: I, now: DateTime<Utc>, scan_interval: Duration) -> f64
where
    I: IntoIterator<Item = &'a ErrorRecord>,
{
    let mut history = history.into_iter().peekable();
    if history.peek().is_none() {
        return 100.0;
    }
    let recent = errors_within(history, now, Duration::from_secs(24 * 3600));
    let downtime = recent as f64 * scan_interval.as_secs_f64();
    ((DAY_SECS - downtime) / DAY_SECS * 100.0).max(0.0)
}

pub fn assess_health(
    consecutive_errors: u32,
    availability: f64,
    error_rate_1h: f64,
    backoff_multiplier: u32,
) -> HealthStatus {
    if consecutive_errors >= 10 || availability < 50.0 {
        return HealthStatus::Unhealthy;
    }
    if consecutive_errors >= 3
        || error_rate_1h >= 10.0
        || availability < 90.0
        || backoff_multiplier > 2
    {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorTrend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPattern {
    Frequent,
    Consecutive,
    Sporadic,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTrends {
    pub trend: ErrorTrend,
    pub recent_increase: bool,
    pub pattern: ErrorPattern,
    pub recent_count: usize,
    pub previous_count: usize,
}

impl Default for ErrorTrends {
    fn default() -> Self {
        Self {
            trend: ErrorTrend::Stable,
            recent_increase: false,
            pattern: ErrorPattern::None,
            recent_count: 0,
            previous_count: 0,
        }
    }
}

/// Compares the last hour of errors against the hour before it.
pub fn analyze_trends<'a, I>(history: I, now: DateTime<Utc>, consecutive_errors: u32) -> ErrorTrends
where
    I: IntoIterator<Item = &'a ErrorRecord>,
{
    let one_hour_ago = now - chrono::Duration::hours(1);
    let two_hours_ago = now - chrono::Duration::hours(2);

    let mut any = false;
    let (mut recent, mut previous) = (0usize, 0usize);
    for record in history {
        any = true;
        if record.timestamp > one_hour_ago {
            recent += 1;
        } else if record.timestamp > two_hours_ago {
            previous += 1;
        }
    }
    if !any {
        return ErrorTrends::default();
    }

    let (trend, recent_increase) = if recent as f64 > previous as f64 * 1.5 {
        (ErrorTrend::Increasing, true)
    } else if (recent as f64) < previous as f64 * 0.5 {
        (ErrorTrend::Decreasing, false)
    } else {
        (ErrorTrend::Stable, false)
    };

    let pattern = if recent >= 5 {
        ErrorPattern::Frequent
    } else if consecutive_errors >= 3 {
        ErrorPattern::Consecutive
    } else if recent > 0 {
        ErrorPattern::Sporadic
    } else {
        ErrorPattern::None
    };

    ErrorTrends {
        trend,
        recent_increase,
        pattern,
        recent_count: recent,
        previous_count: previous,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Pass,
    Fail,
}

impl From<bool> for CheckOutcome {
    fn from(ok: bool) -> Self {
        if ok {
            Self::Pass
        } else {
            Self::Fail
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthChecks {
    pub api_connection: CheckOutcome,
    pub data_age: CheckOutcome,
    pub error_rate: CheckOutcome,
    pub consecutive_errors: CheckOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckReport {
    pub overall_healthy: bool,
    pub api_connectivity: bool,
    pub data_freshness: bool,
    pub error_rate_acceptable: bool,
    pub consecutive_errors_ok: bool,
    pub checks: HealthChecks,
    pub error_rate_1h: f64,
    pub consecutive_errors: u32,
    pub data_age_secs: Option<f64>,
    pub scan_interval_secs: u64,
    pub timestamp: DateTime<Utc>,
    pub check_duration_secs: f64,
}

impl HealthCheckReport {
    pub fn status(&self) -> HealthStatus {
        if self.overall_healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

fn chrono_span(period: Duration) -> chrono::Duration {
    chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::days(3650))
}
