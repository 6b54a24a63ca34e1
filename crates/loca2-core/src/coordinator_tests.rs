use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::client::{ApiError, LocationSource};
use crate::config::{ConfigError, CoordinatorConfig};
use crate::coordinator::Coordinator;
use crate::failure::{ErrorCategory, FailureKind, Severity};
use crate::model::{Device, Location};
use crate::notify::{self, Notification, Notifier, NotifyError};

/// Replays scripted fetch results; the last one repeats once the script runs dry.
struct ScriptedSource {
    script: VecDeque<Result<Vec<Device>, ApiError>>,
    fetches: usize,
    reachable: bool,
    location: Result<Location, ApiError>,
    closed: bool,
}

impl ScriptedSource {
    fn new(script: Vec<Result<Vec<Device>, ApiError>>) -> Self {
        Self {
            script: script.into(),
            fetches: 0,
            reachable: true,
            location: Err(ApiError::Api {
                status: None,
                message: "no location data".into(),
            }),
            closed: false,
        }
    }
}

#[async_trait]
impl LocationSource for ScriptedSource {
    async fn authenticate(&mut self) -> Result<(), ApiError> {
        if self.reachable {
            Ok(())
        } else {
            Err(ApiError::Connection("unreachable".into()))
        }
    }

    async fn fetch_devices(&mut self) -> Result<Vec<Device>, ApiError> {
        self.fetches += 1;
        if self.script.len() > 1 {
            self.script.pop_front().unwrap_or(Ok(Vec::new()))
        } else {
            self.script.front().cloned().unwrap_or(Ok(Vec::new()))
        }
    }

    async fn fetch_device_location(&mut self, _device_id: &str) -> Result<Location, ApiError> {
        self.location.clone()
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Created(String),
    Dismissed(String),
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    events: Arc<Mutex<Vec<Event>>>,
    messages: Arc<Mutex<Vec<Notification>>>,
    failing: bool,
}

impl RecordingNotifier {
    fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    fn created(&self, id: &str) -> usize {
        self.events
            .lock()
            .expect("events")
            .iter()
            .filter(|e| **e == Event::Created(id.to_string()))
            .count()
    }

    fn dismissed(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("events")
            .iter()
            .filter_map(|e| match e {
                Event::Dismissed(id) => Some(id.clone()),
                Event::Created(_) => None,
            })
            .collect()
    }

    fn last_message(&self, id: &str) -> Option<String> {
        self.messages
            .lock()
            .expect("messages")
            .iter()
            .rev()
            .find(|n| n.id == id)
            .map(|n| n.message.clone())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn create(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.events
            .lock()
            .expect("events")
            .push(Event::Created(notification.id.clone()));
        if self.failing {
            return Err(NotifyError::Unavailable("host offline".into()));
        }
        self.messages.lock().expect("messages").push(notification.clone());
        Ok(())
    }

    async fn dismiss(&self, id: &str) -> Result<(), NotifyError> {
        self.events
            .lock()
            .expect("events")
            .push(Event::Dismissed(id.to_string()));
        Ok(())
    }
}

fn device(id: &str, name: &str) -> Device {
    Device::new(id, name).expect("device")
}

fn fleet() -> Vec<Device> {
    vec![device("1", "Boat"), device("2", "Car"), device("3", "Bike")]
}

fn connection_error() -> Result<Vec<Device>, ApiError> {
    Err(ApiError::Connection("timed out".into()))
}

fn coordinator(
    script: Vec<Result<Vec<Device>, ApiError>>,
) -> (Coordinator<ScriptedSource>, RecordingNotifier) {
    coordinator_with(ScriptedSource::new(script), RecordingNotifier::default())
}

fn coordinator_with(
    source: ScriptedSource,
    notifier: RecordingNotifier,
) -> (Coordinator<ScriptedSource>, RecordingNotifier) {
    let coordinator = Coordinator::new(source, Box::new(notifier.clone()), CoordinatorConfig::default())
        .expect("coordinator");
    (coordinator, notifier)
}

#[tokio::test(start_paused = true)]
async fn identical_successful_cycles_are_idempotent() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![Ok(fleet())]);

    // Act
    let first = coordinator.refresh().await.expect("first cycle");
    let second = coordinator.refresh().await.expect("second cycle");

    // Assert
    assert_eq!(*first, *second);
    assert_eq!(first.len(), 3);
    assert_eq!(coordinator.consecutive_errors(), 0);
    assert!(coordinator.last_update_success());
    assert_eq!(coordinator.next_run_delay(), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn disabled_devices_are_dropped_after_fetch() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![Ok(fleet())]);
    coordinator.update_disabled_devices(["2".to_string()]);

    // Act
    let devices = coordinator.refresh().await.expect("cycle");

    // Assert
    assert_eq!(devices.keys().cloned().collect::<Vec<_>>(), ["1", "3"]);
    assert_eq!(coordinator.get_diagnostic_info().configuration.disabled_devices, 1);
}

#[tokio::test(start_paused = true)]
async fn backoff_interval_never_shrinks_and_stays_under_ceiling() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![connection_error()]);
    let mut previous = coordinator.effective_interval();
    let mut multipliers = Vec::new();

    // Act + Assert
    for _ in 0..12 {
        let failed = coordinator.refresh().await.expect_err("failure");
        assert_eq!(failed.category, ErrorCategory::Network);

        let effective = coordinator.effective_interval();
        assert!(effective >= previous, "{effective:?} < {previous:?}");
        assert!(effective <= Duration::from_secs(300));
        assert!(coordinator.next_run_delay() <= Duration::from_secs(300));
        previous = effective;
        multipliers.push(coordinator.backoff_multiplier());
    }

    assert_eq!(multipliers, [1, 1, 1, 1, 2, 4, 8, 8, 8, 8, 8, 8]);
    assert_eq!(coordinator.effective_interval(), Duration::from_secs(240));
    assert_eq!(coordinator.consecutive_errors(), 12);
}

#[tokio::test(start_paused = true)]
async fn backoff_pause_is_capped_and_awaited_by_refresh() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![
        connection_error(),
        connection_error(),
        connection_error(),
        connection_error(),
        connection_error(),
        Ok(fleet()),
    ]);
    for _ in 0..5 {
        let _ = coordinator.refresh().await;
    }
    assert_eq!(coordinator.backoff_multiplier(), 2);

    // Act
    let started = Instant::now();
    coordinator.refresh().await.expect("recovery");

    // Assert
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() < Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn severity_escalates_with_the_error_streak() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![connection_error()]);
    let mut severities = Vec::new();

    // Act
    for _ in 0..10 {
        severities.push(coordinator.refresh().await.expect_err("failure").severity);
    }

    // Assert
    assert_eq!(severities[0], Severity::Medium);
    assert_eq!(severities[4], Severity::High);
    assert_eq!(severities[9], Severity::Critical);
}

#[tokio::test(start_paused = true)]
async fn recovery_resets_counters_and_notifies_exactly_once() {
    // Arrange
    let mut script: Vec<_> = (0..6).map(|_| connection_error()).collect();
    script.push(Ok(fleet()));
    let (mut coordinator, notifier) = coordinator(script);
    for _ in 0..6 {
        let _ = coordinator.refresh().await;
    }
    assert!(coordinator.backoff_multiplier() > 1);

    // Act
    coordinator.refresh().await.expect("recovery");
    coordinator.refresh().await.expect("steady state");

    // Assert
    assert_eq!(coordinator.consecutive_errors(), 0);
    assert_eq!(coordinator.recovery_attempts(), 0);
    assert_eq!(coordinator.backoff_multiplier(), 1);
    assert_eq!(notifier.created(notify::RECOVERY), 1);
    assert_eq!(
        notifier.dismissed(),
        [notify::AUTH_FAILED, notify::CONNECTION_LOST, notify::RATE_LIMITED]
    );
}

#[tokio::test(start_paused = true)]
async fn same_failure_within_cooldown_notifies_once() {
    // Arrange
    let (mut coordinator, notifier) = coordinator(vec![connection_error()]);

    // Act
    for _ in 0..4 {
        let _ = coordinator.refresh().await;
    }
    let within_cooldown = notifier.created(notify::CONNECTION_LOST);
    tokio::time::advance(Duration::from_secs(301)).await;
    let _ = coordinator.refresh().await;

    // Assert
    assert_eq!(within_cooldown, 1);
    assert_eq!(notifier.created(notify::CONNECTION_LOST), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_does_not_start_the_cooldown() {
    // Arrange
    let source = ScriptedSource::new(vec![connection_error()]);
    let (mut coordinator, notifier) = coordinator_with(source, RecordingNotifier::failing());

    // Act
    for _ in 0..4 {
        let _ = coordinator.refresh().await;
    }

    // Assert
    assert_eq!(notifier.created(notify::CONNECTION_LOST), 2);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_doubles_interval_and_counts() {
    // Arrange
    let (mut coordinator, notifier) = coordinator(vec![Err(ApiError::RateLimited {
        retry_after: Some(Duration::from_secs(60)),
    })]);

    // Act
    let failed = coordinator.refresh().await.expect_err("rate limited");

    // Assert
    assert_eq!(failed.kind, FailureKind::RateLimit);
    assert_eq!(failed.category, ErrorCategory::Api);
    assert_eq!(failed.retry_after, Some(Duration::from_secs(60)));
    let info = coordinator.rate_limit_info();
    assert_eq!(info.rate_limit_count, 1);
    assert_eq!(info.current_scan_interval_secs, 60);
    assert_eq!(info.original_scan_interval_secs, 30);
    assert_eq!(info.backoff_multiplier, 1);
    assert!(info.last_rate_limit.is_some());
    assert_eq!(coordinator.next_run_delay(), Duration::from_secs(60));
    assert_eq!(notifier.created(notify::RATE_LIMITED), 1);
    let message = notifier.last_message(notify::RATE_LIMITED).expect("message");
    assert!(message.contains("from 30s to 60s"), "{message}");
}

#[tokio::test(start_paused = true)]
async fn refresh_during_rate_limit_cooldown_waits_it_out() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![
        Err(ApiError::RateLimited { retry_after: None }),
        Ok(fleet()),
    ]);
    let _ = coordinator.refresh().await;

    // Act
    let started = Instant::now();
    coordinator.refresh().await.expect("after cooldown");

    // Assert
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(coordinator.source().fetches, 2);
}

#[tokio::test(start_paused = true)]
async fn rate_limited_interval_is_restored_after_ten_quiet_minutes() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![
        Err(ApiError::RateLimited { retry_after: None }),
        Ok(fleet()),
    ]);
    let _ = coordinator.refresh().await;

    // Act
    coordinator.refresh().await.expect("first success");
    let kept = coordinator.scan_interval();
    tokio::time::advance(Duration::from_secs(601)).await;
    coordinator.refresh().await.expect("later success");

    // Assert
    assert_eq!(kept, Duration::from_secs(60));
    assert_eq!(coordinator.scan_interval(), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn auth_failure_is_critical_but_not_counted() {
    // Arrange
    let (mut coordinator, notifier) = coordinator(vec![
        Err(ApiError::Auth("invalid account or password".into())),
        Ok(fleet()),
    ]);

    // Act
    let failed = coordinator.refresh().await.expect_err("auth failure");
    let streak = coordinator.consecutive_errors();
    let pending = coordinator.recovery_attempts();
    coordinator.refresh().await.expect("recovered");

    // Assert
    assert_eq!(failed.category, ErrorCategory::Auth);
    assert_eq!(failed.severity, Severity::Critical);
    assert_eq!((streak, pending), (0, 1));
    assert_eq!(notifier.created(notify::AUTH_FAILED), 1);
    assert_eq!(notifier.created(notify::RECOVERY), 1);
}

#[tokio::test(start_paused = true)]
async fn location_lookup_failure_returns_none_and_is_recorded() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![Ok(fleet())]);

    // Act
    let location = coordinator.get_device_location("1").await;

    // Assert
    assert!(location.is_none());
    assert_eq!(coordinator.consecutive_errors(), 0);
    let last = coordinator.error_history().back().cloned().expect("recorded");
    assert_eq!(last.kind, FailureKind::LocationFetch);
    assert_eq!(last.context.as_deref(), Some("1"));
}

#[tokio::test(start_paused = true)]
async fn location_lookup_success_passes_through() {
    // Arrange
    let mut source = ScriptedSource::new(vec![Ok(fleet())]);
    source.location = Ok(Location::new(52.0, 4.0).expect("location"));
    let (mut coordinator, _) = coordinator_with(source, RecordingNotifier::default());

    // Act
    let location = coordinator.get_device_location("1").await;

    // Assert
    assert_eq!(location.map(|l| (l.latitude, l.longitude)), Some((52.0, 4.0)));
    assert!(coordinator.error_history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scan_interval_changes_are_bounds_checked() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![Ok(fleet())]);

    // Act
    let too_fast = coordinator.adjust_scan_interval(Duration::from_secs(5));
    let accepted = coordinator.update_configuration(Duration::from_secs(120), ["3".to_string()]);

    // Assert
    assert_eq!(
        too_fast,
        Err(ConfigError::ScanIntervalOutOfRange { got: 5, min: 10, max: 300 })
    );
    assert!(accepted.is_ok());
    assert_eq!(coordinator.scan_interval(), Duration::from_secs(120));
    assert_eq!(coordinator.original_scan_interval(), Duration::from_secs(120));
    assert_eq!(coordinator.refresh().await.expect("cycle").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn diagnostic_snapshot_reflects_failures() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![
        connection_error(),
        connection_error(),
        connection_error(),
        Err(ApiError::Api { status: Some(500), message: "boom".into() }),
    ]);

    // Act
    for _ in 0..4 {
        let _ = coordinator.refresh().await;
    }
    let diag = coordinator.get_diagnostic_info();

    // Assert
    assert!(!diag.coordinator.last_update_success);
    assert!(!diag.coordinator.data_available);
    assert_eq!(diag.coordinator.update_count, 4);
    assert_eq!(diag.coordinator.recovery_attempts, 4);
    assert_eq!(diag.error_tracking.total_errors, 4);
    assert_eq!(diag.error_tracking.error_categories[&ErrorCategory::Network], 3);
    assert_eq!(diag.error_tracking.error_categories[&ErrorCategory::Api], 1);
    assert_eq!(diag.error_tracking.error_categories[&ErrorCategory::Auth], 0);
    assert_eq!(diag.error_tracking.error_rate_1h, 4.0);
    assert_eq!(diag.coordinator.health_status, crate::health::HealthStatus::Degraded);
    assert!(diag.performance.last_update_secs.is_some());
    assert!(diag.api_client.is_none());
    assert!(diag
        .coordinator
        .last_error
        .unwrap_or_default()
        .contains("HTTP 500"));
}

#[tokio::test(start_paused = true)]
async fn health_check_combines_connectivity_and_streak() {
    // Arrange
    let mut source = ScriptedSource::new(vec![Ok(fleet())]);
    source.reachable = false;
    let (mut coordinator, _) = coordinator_with(source, RecordingNotifier::default());
    coordinator.refresh().await.expect("cycle");

    // Act
    let report = coordinator.perform_health_check().await;

    // Assert
    assert!(!report.overall_healthy);
    assert!(!report.api_connectivity);
    assert!(report.data_freshness);
    assert!(report.consecutive_errors_ok);
    assert_eq!(coordinator.collector().health_summary().total_checks, 1);
}

#[tokio::test(start_paused = true)]
async fn stale_data_fails_the_freshness_check() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![Ok(fleet())]);
    coordinator.refresh().await.expect("cycle");
    tokio::time::advance(Duration::from_secs(91)).await;

    // Act
    let report = coordinator.perform_health_check().await;

    // Assert
    assert!(report.api_connectivity);
    assert!(!report.data_freshness);
    assert!(!report.overall_healthy);
}

#[tokio::test(start_paused = true)]
async fn diagnostic_summary_cadence() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![connection_error()]);
    let first = coordinator.should_log_diagnostic_summary();
    coordinator.log_diagnostic_summary();
    let right_after = coordinator.should_log_diagnostic_summary();

    // Act
    let _ = coordinator.refresh().await;
    tokio::time::advance(Duration::from_secs(301)).await;

    // Assert
    assert!(first);
    assert!(!right_after);
    assert!(coordinator.should_log_diagnostic_summary());
}

#[tokio::test(start_paused = true)]
async fn quiet_coordinator_summarises_every_half_hour() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![Ok(fleet())]);
    coordinator.refresh().await.expect("cycle");
    coordinator.log_diagnostic_summary();

    // Act
    tokio::time::advance(Duration::from_secs(301)).await;
    let after_five = coordinator.should_log_diagnostic_summary();
    tokio::time::advance(Duration::from_secs(1500)).await;

    // Assert
    assert!(!after_five);
    assert!(coordinator.should_log_diagnostic_summary());
}

#[tokio::test(start_paused = true)]
async fn close_releases_the_source() {
    // Arrange
    let (mut coordinator, _) = coordinator(vec![Ok(fleet())]);

    // Act
    coordinator.close().await;

    // Assert
    assert!(coordinator.source().closed);
}

#[test]
fn out_of_range_configuration_is_rejected() {
    let config = CoordinatorConfig {
        scan_interval: Duration::from_secs(400),
        ..CoordinatorConfig::default()
    };
    let result = Coordinator::new(
        ScriptedSource::new(vec![]),
        Box::new(RecordingNotifier::default()),
        config,
    );
    assert!(matches!(result, Err(ConfigError::ScanIntervalOutOfRange { .. })));
}
