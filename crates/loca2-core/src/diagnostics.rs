use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn, Level};

use crate::failure::{ErrorCategory, ErrorRecord, Severity};
use crate::health::HealthStatus;

pub const DEFAULT_HISTORY_SIZE: usize = 100;
pub const SLOW_OPERATION: Duration = Duration::from_secs(5);
pub const VERY_SLOW_OPERATION: Duration = Duration::from_secs(10);

/// Component-tagged facade over `tracing`. Each coordinator owns one, so
/// nothing here is process-global.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    component: String,
}

impl StructuredLogger {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn log_error(&self, record: &ErrorRecord) {
        let component = self.component.as_str();
        let context = record.context.as_deref().unwrap_or("general");
        let category = record.category.as_str();
        let kind = record.kind.as_str();
        let consecutive = record.consecutive_errors;
        let duration_secs = record.duration_secs;
        match record.severity {
            Severity::Low => debug!(
                component, category, kind, duration_secs, consecutive, context,
                "loca2 error: {}", record.message
            ),
            Severity::Medium => warn!(
                component, category, kind, duration_secs, consecutive, context,
                "loca2 error: {}", record.message
            ),
            Severity::High => error!(
                component, category, kind, duration_secs, consecutive, context,
                "loca2 error: {}", record.message
            ),
            Severity::Critical => error!(
                component, category, kind, duration_secs, consecutive, context,
                critical = true,
                "loca2 error: {}", record.message
            ),
        }
    }

    pub fn log_recovery(&self, message: &str, downtime: Duration, attempts: u32) {
        info!(
            component = self.component.as_str(),
            downtime_secs = downtime.as_secs_f64(),
            attempts,
            "loca2 recovery: {message}"
        );
    }

    /// Level escalates with duration: debug, then warn past 5s, error past 10s.
    pub fn log_performance(&self, operation: &str, duration: Duration, details: &str) {
        let component = self.component.as_str();
        let secs = duration.as_secs_f64();
        if duration >= VERY_SLOW_OPERATION {
            error!(component, operation, secs, details, "very slow operation");
        } else if duration >= SLOW_OPERATION {
            warn!(component, operation, secs, details, "slow operation");
        } else {
            debug!(component, operation, secs, details, "operation completed");
        }
    }

    pub fn log_diagnostic(&self, level: Level, message: &str, data: Option<&Value>) {
        let component = self.component.as_str();
        let data = data.map(Value::to_string);
        let data = data.as_deref().unwrap_or("");
        if level == Level::ERROR {
            error!(component, data, "loca2 diagnostic: {message}");
        } else if level == Level::WARN {
            warn!(component, data, "loca2 diagnostic: {message}");
        } else if level == Level::INFO {
            info!(component, data, "loca2 diagnostic: {message}");
        } else {
            debug!(component, data, "loca2 diagnostic: {message}");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub duration_secs: f64,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub details: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub categories: BTreeMap<ErrorCategory, usize>,
    pub recent_errors: Vec<ErrorRecord>,
    pub last_error: Option<ErrorRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_operations: usize,
    pub average_duration_secs: f64,
    pub slow_operations: usize,
    pub recent_operations: Vec<PerformanceRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total_checks: usize,
    /// `None` until the first check is recorded.
    pub current_status: Option<HealthStatus>,
    pub status_distribution: BTreeMap<HealthStatus, usize>,
    pub last_check: Option<HealthCheckRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySizes {
    pub errors: usize,
    pub performance: usize,
    pub health_checks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensiveDiagnostic {
    pub collected_at: DateTime<Utc>,
    pub errors: ErrorSummary,
    pub performance: PerformanceSummary,
    pub health: HealthSummary,
    pub history_sizes: HistorySizes,
}

/// Bounded in-memory telemetry. Recording never fails; oldest entries are
/// evicted once a ring reaches capacity.
#[derive(Debug, Clone)]
pub struct DiagnosticCollector {
    capacity: usize,
    errors: VecDeque<ErrorRecord>,
    performance: VecDeque<PerformanceRecord>,
    health_checks: VecDeque<HealthCheckRecord>,
}

impl Default for DiagnosticCollector {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl DiagnosticCollector {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            errors: VecDeque::with_capacity(capacity),
            performance: VecDeque::with_capacity(capacity),
            health_checks: VecDeque::with_capacity(capacity),
        }
    }

    pub fn add_error(&mut self, mut record: ErrorRecord) {
        record.duration_secs = sanitize_secs(record.duration_secs);
        push_bounded(&mut self.errors, record, self.capacity);
    }

    pub fn add_performance_metric(&mut self, operation: &str, duration: Duration, details: &str) {
        let record = PerformanceRecord {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            duration_secs: duration.as_secs_f64(),
            details: details.to_string(),
        };
        push_bounded(&mut self.performance, record, self.capacity);
    }

    pub fn add_health_check(&mut self, status: HealthStatus, details: Value) {
        let record = HealthCheckRecord {
            timestamp: Utc::now(),
            status,
            details,
        };
        push_bounded(&mut self.health_checks, record, self.capacity);
    }

    pub fn error_summary(&self) -> ErrorSummary {
        let mut categories = BTreeMap::new();
        for record in &self.errors {
            *categories.entry(record.category).or_insert(0) += 1;
        }
        ErrorSummary {
            total_errors: self.errors.len(),
            categories,
            recent_errors: tail(&self.errors, 10),
            last_error: self.errors.back().cloned(),
        }
    }

    pub fn performance_summary(&self) -> PerformanceSummary {
        if self.performance.is_empty() {
            return PerformanceSummary::default();
        }
        let total: f64 = self.performance.iter().map(|p| p.duration_secs).sum();
        let slow = SLOW_OPERATION.as_secs_f64();
        PerformanceSummary {
            total_operations: self.performance.len(),
            average_duration_secs: total / self.performance.len() as f64,
            slow_operations: self
                .performance
                .iter()
                .filter(|p| p.duration_secs > slow)
                .count(),
            recent_operations: tail(&self.performance, 5),
        }
    }

    pub fn health_summary(&self) -> HealthSummary {
        let mut status_distribution = BTreeMap::new();
        for check in &self.health_checks {
            *status_distribution.entry(check.status).or_insert(0) += 1;
        }
        HealthSummary {
            total_checks: self.health_checks.len(),
            current_status: self.health_checks.back().map(|c| c.status),
            status_distribution,
            last_check: self.health_checks.back().cloned(),
        }
    }

    pub fn comprehensive(&self) -> ComprehensiveDiagnostic {
        ComprehensiveDiagnostic {
            collected_at: Utc::now(),
            errors: self.error_summary(),
            performance: self.performance_summary(),
            health: self.health_summary(),
            history_sizes: HistorySizes {
                errors: self.errors.len(),
                performance: self.performance.len(),
                health_checks: self.health_checks.len(),
            },
        }
    }

    pub fn clear(&mut self) {
        self.errors.clear();
        self.performance.clear();
        self.health_checks.clear();
        info!("diagnostic history cleared");
    }
}

/// Multi-line operator summary of a collector snapshot.
pub fn format_diagnostic_summary(diag: &ComprehensiveDiagnostic) -> String {
    let mut out = String::from("=== Loca2 Diagnostic Summary ===\n");
    let _ = writeln!(out, "Errors: {} total", diag.errors.total_errors);
    for (category, count) in &diag.errors.categories {
        let _ = writeln!(out, "  - {category}: {count}");
    }
    let _ = writeln!(out, "Performance: {} operations", diag.performance.total_operations);
    let _ = writeln!(
        out,
        "  - Average duration: {:.2}s",
        diag.performance.average_duration_secs
    );
    let _ = writeln!(out, "  - Slow operations: {}", diag.performance.slow_operations);
    let current = diag
        .health
        .current_status
        .map(HealthStatus::as_str)
        .unwrap_or("unknown");
    let _ = writeln!(out, "Health: {current}");
    let _ = writeln!(out, "  - Total checks: {}", diag.health.total_checks);
    out.push_str(&"=".repeat(32));
    out
}

fn push_bounded<T>(ring: &mut VecDeque<T>, item: T, capacity: usize) {
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(item);
}

fn tail<T: Clone>(ring: &VecDeque<T>, n: usize) -> Vec<T> {
    ring.iter().skip(ring.len().saturating_sub(n)).cloned().collect()
}

fn sanitize_secs(secs: f64) -> f64 {
    if secs.is_finite() && secs > 0.0 {
        secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureKind;
    use serde_json::json;

    fn record(category: ErrorCategory, message: &str) -> ErrorRecord {
        ErrorRecord {
            timestamp: Utc::now(),
            category,
            kind: FailureKind::Unexpected,
            message: message.to_string(),
            duration_secs: 0.25,
            context: None,
            consecutive_errors: 1,
            recovery_attempts: 1,
            severity: Severity::Low,
        }
    }

    #[test]
    fn rings_evict_oldest_entries() {
        let mut collector = DiagnosticCollector::new(3);
        for i in 0..5 {
            collector.add_error(record(ErrorCategory::Network, &format!("e{i}")));
        }
        let summary = collector.error_summary();
        assert_eq!(summary.total_errors, 3);
        let messages: Vec<_> = summary.recent_errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["e2", "e3", "e4"]);
        assert_eq!(summary.last_error.map(|e| e.message), Some("e4".to_string()));
    }

    #[test]
    fn error_summary_counts_categories_and_keeps_last_ten() {
        let mut collector = DiagnosticCollector::default();
        for _ in 0..12 {
            collector.add_error(record(ErrorCategory::Api, "api"));
        }
        collector.add_error(record(ErrorCategory::Auth, "auth"));

        let summary = collector.error_summary();
        assert_eq!(summary.categories[&ErrorCategory::Api], 12);
        assert_eq!(summary.categories[&ErrorCategory::Auth], 1);
        assert_eq!(summary.recent_errors.len(), 10);
    }

    #[test]
    fn malformed_durations_are_recorded_as_zero() {
        let mut collector = DiagnosticCollector::default();
        let mut bad = record(ErrorCategory::Unknown, "nan");
        bad.duration_secs = f64::NAN;
        collector.add_error(bad);
        let mut negative = record(ErrorCategory::Unknown, "negative");
        negative.duration_secs = -3.0;
        collector.add_error(negative);

        let summary = collector.error_summary();
        assert!(summary.recent_errors.iter().all(|e| e.duration_secs == 0.0));
    }

    #[test]
    fn performance_summary_averages_and_counts_slow_operations() {
        let mut collector = DiagnosticCollector::default();
        assert_eq!(collector.performance_summary(), PerformanceSummary::default());

        collector.add_performance_metric("update", Duration::from_secs(1), "");
        collector.add_performance_metric("update", Duration::from_secs(7), "3 devices");
        collector.add_performance_metric("update", Duration::from_secs(4), "");

        let summary = collector.performance_summary();
        assert_eq!(summary.total_operations, 3);
        assert!((summary.average_duration_secs - 4.0).abs() < 1e-9);
        assert_eq!(summary.slow_operations, 1);
        assert_eq!(summary.recent_operations.len(), 3);
    }

    #[test]
    fn health_summary_tracks_current_status_and_distribution() {
        let mut collector = DiagnosticCollector::default();
        assert_eq!(collector.health_summary().current_status, None);

        collector.add_health_check(HealthStatus::Healthy, json!({}));
        collector.add_health_check(HealthStatus::Unhealthy, json!({"api": "fail"}));
        collector.add_health_check(HealthStatus::Healthy, Value::Null);

        let summary = collector.health_summary();
        assert_eq!(summary.total_checks, 3);
        assert_eq!(summary.current_status, Some(HealthStatus::Healthy));
        assert_eq!(summary.status_distribution[&HealthStatus::Healthy], 2);
        assert_eq!(summary.status_distribution[&HealthStatus::Unhealthy], 1);
    }

    #[test]
    fn clear_empties_every_ring() {
        let mut collector = DiagnosticCollector::default();
        collector.add_error(record(ErrorCategory::Api, "x"));
        collector.add_performance_metric("update", Duration::from_millis(10), "");
        collector.add_health_check(HealthStatus::Degraded, Value::Null);

        collector.clear();

        assert_eq!(collector.comprehensive().history_sizes, HistorySizes::default());
    }

    #[test]
    fn summary_text_lists_categories_and_health() {
        let mut collector = DiagnosticCollector::default();
        collector.add_error(record(ErrorCategory::Network, "down"));
        collector.add_error(record(ErrorCategory::Network, "down"));
        collector.add_performance_metric("update", Duration::from_secs(2), "");

        let text = format_diagnostic_summary(&collector.comprehensive());

        assert!(text.starts_with("=== Loca2 Diagnostic Summary ==="));
        assert!(text.contains("Errors: 2 total"));
        assert!(text.contains("  - network: 2"));
        assert!(text.contains("  - Average duration: 2.00s"));
        assert!(text.contains("Health: unknown"));
    }

    #[test]
    fn diagnostic_snapshot_serializes_category_keys_as_strings() {
        let mut collector = DiagnosticCollector::default();
        collector.add_error(record(ErrorCategory::Auth, "denied"));

        let value = serde_json::to_value(collector.comprehensive()).expect("json");

        assert_eq!(value["errors"]["categories"]["authentication"], json!(1));
    }
}
