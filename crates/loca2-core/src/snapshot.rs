use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::ClientDiagnostics;
use crate::failure::{ErrorCategory, ErrorRecord};
use crate::health::{ErrorTrends, HealthStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSnapshot {
    pub coordinator: CoordinatorStatus,
    pub rate_limiting: RateLimitInfo,
    pub error_tracking: ErrorTracking,
    pub performance: PerformanceInfo,
    pub configuration: ConfigurationInfo,
    pub api_client: Option<ClientDiagnostics>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub last_update_success: bool,
    pub last_error: Option<String>,
    pub update_count: u64,
    pub data_available: bool,
    pub device_count: usize,
    pub last_successful_update: Option<DateTime<Utc>>,
    pub recovery_attempts: u32,
    /// Seconds since the last successful update.
    pub uptime_secs: f64,
    pub health_status: HealthStatus,
    pub availability_24h: f64,
    pub effective_interval_secs: u64,
    pub next_run_in_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub rate_limit_count: u32,
    pub last_rate_limit: Option<DateTime<Utc>>,
    pub current_scan_interval_secs: u64,
    pub original_scan_interval_secs: u64,
    pub backoff_multiplier: u32,
    pub consecutive_errors: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorTracking {
    pub error_categories: BTreeMap<ErrorCategory, u64>,
    pub recent_errors: Vec<ErrorRecord>,
    pub total_errors: usize,
    pub last_error: Option<ErrorRecord>,
    pub error_rate_1h: f64,
    pub error_rate_24h: f64,
    pub error_trends: ErrorTrends,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceInfo {
    pub average_update_secs: Option<f64>,
    pub slow_updates_count: usize,
    pub last_update_secs: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationInfo {
    pub scan_interval_secs: u64,
    pub original_scan_interval_secs: u64,
    pub disabled_devices: usize,
    pub backoff_multiplier: u32,
}
