use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://www.mijnloca.nl";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("scan interval {got}s outside allowed range {min}..={max}s")]
    ScanIntervalOutOfRange { got: u64, min: u64, max: u64 },
    #[error("request timeout must be greater than zero")]
    ZeroTimeout,
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub account: String,
    pub password: String,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub slow_response_threshold: Duration,
}

impl ClientConfig {
    pub fn new(account: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account.trim().is_empty() {
            return Err(ConfigError::Empty("account"));
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Empty("base url"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            account: String::new(),
            password: String::new(),
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            slow_response_threshold: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub scan_interval: Duration,
    pub min_scan_interval: Duration,
    pub max_scan_interval: Duration,
    pub disabled_devices: BTreeSet<String>,
    /// Consecutive failures before the backoff multiplier starts doubling.
    pub max_consecutive_errors: u32,
    pub max_backoff_multiplier: u32,
    pub rate_limit_cooldown: Duration,
    pub backoff_pause_cap: Duration,
    pub rate_limit_restore_after: Duration,
    pub slow_update_threshold: Duration,
    pub notification_cooldown: Duration,
    pub error_history_size: usize,
    pub duration_window: usize,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check_scan_interval(self.scan_interval)
    }

    pub fn check_scan_interval(&self, interval: Duration) -> Result<(), ConfigError> {
        if interval < self.min_scan_interval || interval > self.max_scan_interval {
            return Err(ConfigError::ScanIntervalOutOfRange {
                got: interval.as_secs(),
                min: self.min_scan_interval.as_secs(),
                max: self.max_scan_interval.as_secs(),
            });
        }
        Ok(())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            min_scan_interval: Duration::from_secs(10),
            max_scan_interval: Duration::from_secs(300),
            disabled_devices: BTreeSet::new(),
            max_consecutive_errors: 5,
            max_backoff_multiplier: 8,
            rate_limit_cooldown: Duration::from_secs(60),
            backoff_pause_cap: Duration::from_secs(30),
            rate_limit_restore_after: Duration::from_secs(600),
            slow_update_threshold: Duration::from_secs(30),
            notification_cooldown: Duration::from_secs(300),
            error_history_size: 50,
            duration_window: 20,
        }
    }
}
