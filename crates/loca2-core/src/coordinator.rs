use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn, Level};

use crate::client::{ApiError, LocationSource};
use crate::config::{ConfigError, CoordinatorConfig};
use crate::diagnostics::{format_diagnostic_summary, DiagnosticCollector, StructuredLogger};
use crate::failure::{
    classify, determine_severity, ErrorCategory, ErrorRecord, FailureKind, Severity, UpdateFailed,
};
use crate::health::{
    analyze_trends, assess_health, availability, error_rate_for_period, CheckOutcome,
    HealthCheckReport, HealthChecks, HealthStatus,
};
use crate::model::{Device, Location};
use crate::notify::{
    compose_failure, compose_recovery, FailureNotice, Notification, NotificationGate, Notifier,
    CLEARED_ON_RECOVERY,
};
use crate::snapshot::{
    ConfigurationInfo, CoordinatorStatus, DiagnosticSnapshot, ErrorTracking, PerformanceInfo,
    RateLimitInfo,
};

pub type DeviceMap = Arc<BTreeMap<String, Device>>;

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);
const SUMMARY_EVERY_WITH_ERRORS: Duration = Duration::from_secs(5 * 60);
const SUMMARY_EVERY: Duration = Duration::from_secs(30 * 60);

/// Owns the poll cycle and every counter that steers it: consecutive
/// errors, backoff multiplier, rate-limit adjustments and notification
/// cooldowns. One instance per configured account.
pub struct Coordinator<S: LocationSource> {
    source: S,
    notifier: Box<dyn Notifier>,
    config: CoordinatorConfig,
    logger: StructuredLogger,
    collector: DiagnosticCollector,
    gate: NotificationGate,

    devices: DeviceMap,
    last_result: Option<Result<DeviceMap, UpdateFailed>>,
    update_count: u64,

    scan_interval: Duration,
    original_scan_interval: Duration,
    backoff_multiplier: u32,
    consecutive_errors: u32,
    recovery_attempts: u32,
    next_eligible: Option<Instant>,

    rate_limit_count: u32,
    last_rate_limit: Option<Instant>,
    last_rate_limit_at: Option<DateTime<Utc>>,

    last_success: Option<Instant>,
    last_successful_update: Option<DateTime<Utc>>,

    error_history: VecDeque<ErrorRecord>,
    error_categories: BTreeMap<ErrorCategory, u64>,
    update_durations: VecDeque<Duration>,
    last_update_duration: Option<Duration>,
    last_diagnostic_log: Option<Instant>,
}

impl<S: LocationSource> Coordinator<S> {
    pub fn new(
        source: S,
        notifier: Box<dyn Notifier>,
        config: CoordinatorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let error_categories = ErrorCategory::ALL.iter().map(|c| (*c, 0)).collect();

        Ok(Self {
            source,
            notifier,
            logger: StructuredLogger::new("coordinator"),
            collector: DiagnosticCollector::default(),
            gate: NotificationGate::new(config.notification_cooldown),
            devices: Arc::new(BTreeMap::new()),
            last_result: None,
            update_count: 0,
            scan_interval: config.scan_interval,
            original_scan_interval: config.scan_interval,
            backoff_multiplier: 1,
            consecutive_errors: 0,
            recovery_attempts: 0,
            next_eligible: None,
            rate_limit_count: 0,
            last_rate_limit: None,
            last_rate_limit_at: None,
            last_success: None,
            last_successful_update: None,
            error_history: VecDeque::with_capacity(config.error_history_size),
            error_categories,
            update_durations: VecDeque::with_capacity(config.duration_window),
            last_update_duration: None,
            last_diagnostic_log: None,
            config,
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Last good device map, empty before the first successful cycle.
    pub fn devices(&self) -> DeviceMap {
        Arc::clone(&self.devices)
    }

    pub fn last_result(&self) -> Option<Result<DeviceMap, UpdateFailed>> {
        self.last_result.clone()
    }

    pub fn last_update_success(&self) -> bool {
        matches!(self.last_result, Some(Ok(_)))
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts
    }

    pub fn backoff_multiplier(&self) -> u32 {
        self.backoff_multiplier
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    pub fn original_scan_interval(&self) -> Duration {
        self.original_scan_interval
    }

    pub fn error_history(&self) -> &VecDeque<ErrorRecord> {
        &self.error_history
    }

    pub fn collector(&self) -> &DiagnosticCollector {
        &self.collector
    }

    /// Poll interval with the backoff multiplier applied, capped at the ceiling.
    pub fn effective_interval(&self) -> Duration {
        (self.scan_interval * self.backoff_multiplier).min(self.config.max_scan_interval)
    }

    /// How long the scheduler should wait before the next cycle.
    pub fn next_run_delay(&self) -> Duration {
        self.next_run_delay_at(Instant::now())
    }

    fn next_run_delay_at(&self, now: Instant) -> Duration {
        let pause = self
            .next_eligible
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or_default();
        self.effective_interval().max(pause)
    }

    /// Runs one update cycle. A call made during a rate-limit cooldown or
    /// backoff pause waits for it to elapse first.
    pub async fn refresh(&mut self) -> Result<DeviceMap, UpdateFailed> {
        if let Some(eligible) = self.next_eligible.take() {
            if eligible > Instant::now() {
                debug!(
                    wait_secs = eligible.saturating_duration_since(Instant::now()).as_secs_f64(),
                    "waiting for cooldown before next update"
                );
                sleep_until(eligible).await;
            }
        }

        let started = Instant::now();
        self.update_count += 1;
        debug!(attempt = self.recovery_attempts + 1, "fetching device data");

        let result = match self.source.fetch_devices().await {
            Ok(devices) => {
                let map = self.filter_disabled(devices);
                self.handle_success(map, started).await;
                Ok(self.devices())
            }
            Err(err) => Err(self.handle_failure(err, started).await),
        };

        let fetched = result.as_ref().map(|m| m.len()).unwrap_or(0);
        self.track_duration(started.elapsed(), fetched);
        self.last_result = Some(result.clone());
        result
    }

    fn filter_disabled(&self, devices: Vec<Device>) -> BTreeMap<String, Device> {
        let total = devices.len();
        let map: BTreeMap<String, Device> = devices
            .into_iter()
            .filter(|d| !self.config.disabled_devices.contains(&d.id))
            .map(|d| (d.id.clone(), d))
            .collect();
        let filtered = total.saturating_sub(map.len());
        if filtered > 0 {
            debug!(filtered, "filtered out disabled devices");
        }
        map
    }

    async fn handle_success(&mut self, map: BTreeMap<String, Device>, started: Instant) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(started);
        let was_in_error = self.consecutive_errors > 0 || self.recovery_attempts > 0;
        let attempts = self.recovery_attempts;
        let downtime = self
            .last_success
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();

        self.consecutive_errors = 0;
        self.recovery_attempts = 0;
        self.next_eligible = None;
        self.last_success = Some(now);
        self.last_successful_update = Some(Utc::now());
        self.reset_backoff();
        self.maybe_restore_interval(now);
        self.devices = Arc::new(map);

        let count = self.devices.len();
        if was_in_error {
            info!(devices = count, secs = elapsed.as_secs_f64(), "recovered from error state");
            self.logger
                .log_recovery(&format!("fetched {count} devices"), downtime, attempts);
            let notifier = self.notifier.as_ref();
            deliver(notifier, &self.logger, &compose_recovery(count), self.consecutive_errors)
                .await;
            for id in CLEARED_ON_RECOVERY {
                if let Err(err) = notifier.dismiss(id).await {
                    debug!(notification = id, error = %err, "could not clear notification");
                }
            }
        }

        if elapsed > self.config.slow_update_threshold {
            warn!(
                secs = elapsed.as_secs_f64(),
                devices = count,
                "slow update cycle"
            );
        }
        debug!(devices = count, "update cycle succeeded");
    }

    async fn handle_failure(&mut self, err: ApiError, started: Instant) -> UpdateFailed {
        let (category, kind) = classify(&err);
        let retry_after = match &err {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        };

        // Auth failures stay out of the consecutive count but still mark a
        // pending recovery.
        self.recovery_attempts += 1;
        if category != ErrorCategory::Auth {
            self.consecutive_errors += 1;
        }
        if kind == FailureKind::RateLimit {
            self.apply_rate_limit();
        }

        let message = err.to_string();
        let severity = self
            .record_error(category, kind, &message, started.elapsed(), None)
            .severity;
        self.notify_failure(category, kind, severity, &message).await;

        if category != ErrorCategory::Auth && kind != FailureKind::RateLimit {
            self.apply_backoff();
        }

        UpdateFailed {
            category,
            kind,
            severity,
            message,
            retry_after,
        }
    }

    fn record_error(
        &mut self,
        category: ErrorCategory,
        kind: FailureKind,
        message: &str,
        duration: Duration,
        context: Option<String>,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            timestamp: Utc::now(),
            category,
            kind,
            message: message.to_string(),
            duration_secs: duration.as_secs_f64(),
            context,
            consecutive_errors: self.consecutive_errors,
            recovery_attempts: self.recovery_attempts,
            severity: determine_severity(category, kind, self.consecutive_errors),
        };

        while self.error_history.len() >= self.config.error_history_size.max(1) {
            self.error_history.pop_front();
        }
        self.error_history.push_back(record.clone());
        *self.error_categories.entry(category).or_insert(0) += 1;

        self.logger.log_error(&record);
        self.collector.add_error(record.clone());
        record
    }

    async fn notify_failure(
        &mut self,
        category: ErrorCategory,
        kind: FailureKind,
        severity: Severity,
        detail: &str,
    ) {
        let key = (category, kind);
        let now = Instant::now();
        if !self.gate.allows(key, severity, now) {
            debug!(%category, %kind, %severity, "notification suppressed");
            return;
        }

        let notice = FailureNotice {
            category,
            kind,
            severity,
            consecutive_errors: self.consecutive_errors,
            downtime: self.last_success.map(|at| now.saturating_duration_since(at)),
            original_interval: self.original_scan_interval,
            current_interval: self.scan_interval,
            detail,
        };
        let Some(notification) = compose_failure(&notice) else {
            return;
        };

        let sent = deliver(
            self.notifier.as_ref(),
            &self.logger,
            &notification,
            self.consecutive_errors,
        )
        .await;
        if sent {
            self.gate.record_sent(key, now);
        }
    }

    fn apply_rate_limit(&mut self) {
        let now = Instant::now();
        self.rate_limit_count += 1;
        self.last_rate_limit = Some(now);
        self.last_rate_limit_at = Some(Utc::now());

        let doubled = (self.scan_interval * 2).min(self.config.max_scan_interval);
        if doubled != self.scan_interval {
            info!(
                from_secs = self.scan_interval.as_secs(),
                to_secs = doubled.as_secs(),
                "adjusting scan interval due to rate limiting"
            );
            self.scan_interval = doubled;
        }
        self.next_eligible = Some(now + self.config.rate_limit_cooldown);
    }

    fn apply_backoff(&mut self) {
        if self.consecutive_errors < self.config.max_consecutive_errors {
            return;
        }
        warn!(
            consecutive = self.consecutive_errors,
            "too many consecutive errors, applying exponential backoff"
        );
        self.backoff_multiplier =
            (self.backoff_multiplier * 2).min(self.config.max_backoff_multiplier.max(1));
        let effective = self.effective_interval();
        info!(
            interval_secs = effective.as_secs(),
            multiplier = self.backoff_multiplier,
            "applying backoff"
        );
        self.next_eligible = Some(Instant::now() + effective.min(self.config.backoff_pause_cap));
    }

    fn reset_backoff(&mut self) {
        if self.backoff_multiplier > 1 {
            info!("resetting backoff, returning to normal polling interval");
            self.backoff_multiplier = 1;
        }
    }

    fn maybe_restore_interval(&mut self, now: Instant) {
        if self.scan_interval == self.original_scan_interval {
            return;
        }
        let Some(limited_at) = self.last_rate_limit else {
            return;
        };
        if now.saturating_duration_since(limited_at) > self.config.rate_limit_restore_after {
            info!(
                secs = self.original_scan_interval.as_secs(),
                "restoring original scan interval"
            );
            self.scan_interval = self.original_scan_interval;
        }
    }

    fn track_duration(&mut self, elapsed: Duration, devices: usize) {
        self.last_update_duration = Some(elapsed);
        while self.update_durations.len() >= self.config.duration_window.max(1) {
            self.update_durations.pop_front();
        }
        self.update_durations.push_back(elapsed);

        let details = format!("devices_fetched={devices}");
        self.logger
            .log_performance("coordinator_update", elapsed, &details);
        self.collector
            .add_performance_metric("coordinator_update", elapsed, &details);
    }

    /// Location for one device from a fresh batch fetch. Failures are
    /// recorded and logged, never returned.
    pub async fn get_device_location(&mut self, device_id: &str) -> Option<Location> {
        let started = Instant::now();
        match self.source.fetch_device_location(device_id).await {
            Ok(location) => Some(location),
            Err(err) => {
                let (category, kind) = match err {
                    ApiError::Unexpected(_) => {
                        (ErrorCategory::Unknown, FailureKind::LocationFetchUnexpected)
                    }
                    _ => (ErrorCategory::Api, FailureKind::LocationFetch),
                };
                let message = err.to_string();
                let record = self.record_error(
                    category,
                    kind,
                    &message,
                    started.elapsed(),
                    Some(device_id.to_string()),
                );
                self.notify_failure(category, kind, record.severity, &message)
                    .await;
                warn!(device = device_id, error = %err, "failed to get device location");
                None
            }
        }
    }

    /// Sets both the current and the original interval. Out-of-range values
    /// are rejected and leave the coordinator untouched.
    pub fn adjust_scan_interval(&mut self, interval: Duration) -> Result<(), ConfigError> {
        if let Err(err) = self.config.check_scan_interval(interval) {
            warn!(error = %err, "invalid scan interval");
            return Err(err);
        }
        self.scan_interval = interval;
        self.original_scan_interval = interval;
        self.config.scan_interval = interval;
        info!(secs = interval.as_secs(), "scan interval adjusted");
        Ok(())
    }

    pub fn update_disabled_devices<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.config.disabled_devices = ids.into_iter().collect::<BTreeSet<_>>();
        info!(disabled = ?self.config.disabled_devices, "updated disabled devices");
    }

    pub fn update_configuration<I>(&mut self, interval: Duration, disabled: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        let adjusted = self.adjust_scan_interval(interval);
        self.update_disabled_devices(disabled);
        info!(
            scan_interval_secs = interval.as_secs(),
            disabled = self.config.disabled_devices.len(),
            "configuration updated"
        );
        adjusted
    }

    pub fn rate_limit_info(&self) -> RateLimitInfo {
        RateLimitInfo {
            rate_limit_count: self.rate_limit_count,
            last_rate_limit: self.last_rate_limit_at,
            current_scan_interval_secs: self.scan_interval.as_secs(),
            original_scan_interval_secs: self.original_scan_interval.as_secs(),
            backoff_multiplier: self.backoff_multiplier,
            consecutive_errors: self.consecutive_errors,
        }
    }

    pub fn get_diagnostic_info(&self) -> DiagnosticSnapshot {
        let now = Utc::now();
        let availability_24h = availability(&self.error_history, now, self.scan_interval);
        let error_rate_1h = error_rate_for_period(&self.error_history, now, HOUR);
        let error_rate_24h = error_rate_for_period(&self.error_history, now, DAY);
        let health_status = assess_health(
            self.consecutive_errors,
            availability_24h,
            error_rate_1h,
            self.backoff_multiplier,
        );
        let uptime_secs = self
            .last_success
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let recent_start = self.error_history.len().saturating_sub(10);
        let average_update_secs = (!self.update_durations.is_empty()).then(|| {
            self.update_durations.iter().map(Duration::as_secs_f64).sum::<f64>()
                / self.update_durations.len() as f64
        });
        let slow_updates_count = self
            .update_durations
            .iter()
            .filter(|d| **d > self.config.slow_update_threshold)
            .count();

        DiagnosticSnapshot {
            coordinator: CoordinatorStatus {
                last_update_success: self.last_update_success(),
                last_error: match &self.last_result {
                    Some(Err(err)) => Some(err.to_string()),
                    _ => None,
                },
                update_count: self.update_count,
                data_available: self.last_successful_update.is_some(),
                device_count: self.devices.len(),
                last_successful_update: self.last_successful_update,
                recovery_attempts: self.recovery_attempts,
                uptime_secs,
                health_status,
                availability_24h,
                effective_interval_secs: self.effective_interval().as_secs(),
                next_run_in_secs: self.next_run_delay().as_secs_f64(),
            },
            rate_limiting: self.rate_limit_info(),
            error_tracking: ErrorTracking {
                error_categories: self.error_categories.clone(),
                recent_errors: self.error_history.iter().skip(recent_start).cloned().collect(),
                total_errors: self.error_history.len(),
                last_error: self.error_history.back().cloned(),
                error_rate_1h,
                error_rate_24h,
                error_trends: analyze_trends(&self.error_history, now, self.consecutive_errors),
            },
            performance: PerformanceInfo {
                average_update_secs,
                slow_updates_count,
                last_update_secs: self.last_update_duration.map(|d| d.as_secs_f64()),
            },
            configuration: ConfigurationInfo {
                scan_interval_secs: self.scan_interval.as_secs(),
                original_scan_interval_secs: self.original_scan_interval.as_secs(),
                disabled_devices: self.config.disabled_devices.len(),
                backoff_multiplier: self.backoff_multiplier,
            },
            api_client: self.source.diagnostics(),
            timestamp: now,
        }
    }

    /// Connectivity, data age, error rate and error streak in one report.
    /// The result is also stored in the diagnostic collector.
    pub async fn perform_health_check(&mut self) -> HealthCheckReport {
        let started = Instant::now();
        let api_connectivity = self.source.test_connection().await;

        let data_age = self.last_success.map(|at| at.elapsed());
        let data_freshness = data_age.map_or(true, |age| age < self.scan_interval * 3);
        let error_rate_1h = error_rate_for_period(&self.error_history, Utc::now(), HOUR);
        let error_rate_acceptable = error_rate_1h < 10.0;
        let consecutive_errors_ok = self.consecutive_errors < 5;
        let overall_healthy =
            api_connectivity && data_freshness && error_rate_acceptable && consecutive_errors_ok;

        let report = HealthCheckReport {
            overall_healthy,
            api_connectivity,
            data_freshness,
            error_rate_acceptable,
            consecutive_errors_ok,
            checks: HealthChecks {
                api_connection: CheckOutcome::from(api_connectivity),
                data_age: CheckOutcome::from(data_freshness),
                error_rate: CheckOutcome::from(error_rate_acceptable),
                consecutive_errors: CheckOutcome::from(consecutive_errors_ok),
            },
            error_rate_1h,
            consecutive_errors: self.consecutive_errors,
            data_age_secs: data_age.map(|d| d.as_secs_f64()),
            scan_interval_secs: self.scan_interval.as_secs(),
            timestamp: Utc::now(),
            check_duration_secs: started.elapsed().as_secs_f64(),
        };

        let details = serde_json::to_value(&report).unwrap_or_default();
        self.collector.add_health_check(report.status(), details.clone());
        let (level, verdict) = if overall_healthy {
            (Level::INFO, "HEALTHY")
        } else {
            (Level::WARN, "UNHEALTHY")
        };
        self.logger.log_diagnostic(
            level,
            &format!("health check completed: {verdict}"),
            Some(&details),
        );
        report
    }

    /// True on the first call, then every 5 minutes while errors are on
    /// record and every 30 minutes regardless.
    pub fn should_log_diagnostic_summary(&self) -> bool {
        let Some(last) = self.last_diagnostic_log else {
            return true;
        };
        let since = last.elapsed();
        (!self.error_history.is_empty() && since > SUMMARY_EVERY_WITH_ERRORS) || since > SUMMARY_EVERY
    }

    pub fn log_diagnostic_summary(&mut self) {
        let diag = self.get_diagnostic_info();
        self.logger.log_diagnostic(
            Level::INFO,
            "generating diagnostic summary",
            Some(&json!({ "summary_type": "full" })),
        );
        info!("{}", format_diagnostic_summary(&self.collector.comprehensive()));

        let status = &diag.coordinator;
        info!(
            last_update_success = status.last_update_success,
            devices = status.device_count,
            updates = status.update_count,
            health = %status.health_status,
            last_error = status.last_error.as_deref().unwrap_or("none"),
            "coordinator status"
        );
        let limits = &diag.rate_limiting;
        info!(
            rate_limits = limits.rate_limit_count,
            scan_interval_secs = limits.current_scan_interval_secs,
            consecutive_errors = limits.consecutive_errors,
            "rate limiting"
        );
        if let Some(api) = &diag.api_client {
            info!(
                status = %api.connection_status,
                success_rate = api.success_rate,
                errors = api.error_count,
                last_error = api.last_error.as_deref().unwrap_or("none"),
                "api client"
            );
        }
        self.last_diagnostic_log = Some(Instant::now());
    }

    pub fn health_status(&self) -> HealthStatus {
        self.get_diagnostic_info().coordinator.health_status
    }

    pub async fn close(&mut self) {
        self.source.close().await;
        self.next_eligible = None;
        info!("coordinator closed");
    }
}

/// Sends one notification. Delivery failures are logged at low severity
/// and reported as `false`.
async fn deliver(
    notifier: &dyn Notifier,
    logger: &StructuredLogger,
    notification: &Notification,
    consecutive_errors: u32,
) -> bool {
    match notifier.create(notification).await {
        Ok(()) => {
            logger.log_diagnostic(
                Level::INFO,
                &format!("user notification sent: {}", notification.title),
                Some(&json!({
                    "notification_id": notification.id,
                    "severity": notification.severity,
                    "consecutive_errors": consecutive_errors,
                })),
            );
            true
        }
        Err(err) => {
            debug!(
                notification = %notification.id,
                error = %err,
                "failed to send user notification"
            );
            false
        }
    }
}
