use crate::render::{human_devices, human_health, human_location, human_trackers};
use chrono::{TimeZone, Utc};
use loca2_core::health::{CheckOutcome, HealthChecks};
use loca2_core::{Device, HealthCheckReport, Location, TrackedDevice};

fn boat() -> Device {
    let mut device = Device::new("101", "Sloep").expect("device");
    device.latitude = Some(52.370216);
    device.longitude = Some(4.895168);
    device.city = Some("Amsterdam".into());
    device.battery_level = Some(85);
    device
}

#[test]
fn devices_render_position_address_and_battery() {
    // Arrange
    let boat = boat();
    let parked = Device::new("102", "Trailer").expect("device");

    // Act
    let text = human_devices(&[&boat, &parked]);

    // Assert
    assert!(text.starts_with("=== Loca2 Devices (2) ==="));
    assert!(text.contains("101 [unknown] Sloep"));
    assert!(text.contains("Position:  52.370216, 4.895168"));
    assert!(text.contains("Address:   Amsterdam"));
    assert!(text.contains("Battery:   85%"));
    assert!(text.contains("Position:  no fix"));
}

#[test]
fn missing_location_is_reported_plainly() {
    assert_eq!(
        human_location("7", None),
        "Device 7: no location available\n"
    );
}

#[test]
fn location_renders_accuracy_and_time() {
    // Arrange
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("valid date");
    let location = Location::new(51.9, 4.4)
        .expect("location")
        .with_accuracy(Some(12.0))
        .with_timestamp(Some(at));

    // Act
    let text = human_location("7", Some(&location));

    // Assert
    assert!(text.contains("Device 7: 51.900000, 4.400000"));
    assert!(text.contains("Accuracy:  12 m"));
    assert!(text.contains("2026-03-01T12:00:00+00:00"));
}

#[test]
fn health_marks_failing_checks() {
    // Arrange
    let report = HealthCheckReport {
        overall_healthy: false,
        api_connectivity: true,
        data_freshness: false,
        error_rate_acceptable: true,
        consecutive_errors_ok: true,
        checks: HealthChecks {
            api_connection: CheckOutcome::Pass,
            data_age: CheckOutcome::Fail,
            error_rate: CheckOutcome::Pass,
            consecutive_errors: CheckOutcome::Pass,
        },
        error_rate_1h: 0.0,
        consecutive_errors: 0,
        data_age_secs: Some(120.0),
        scan_interval_secs: 30,
        timestamp: Utc::now(),
        check_duration_secs: 0.1,
    };

    // Act
    let text = human_health(&report);

    // Assert
    assert!(text.starts_with("=== Loca2 Health: unhealthy ==="), "{text}");
    assert!(text.contains("data freshness:     FAIL (age 120s)"));
    assert!(text.contains("api connection:     pass"));
}

#[test]
fn trackers_fall_back_to_cached_fix() {
    // Arrange
    let mut tracked = TrackedDevice::new("101");
    tracked.record_location(Location::new(52.0, 5.0).ok().map(|l| l.with_accuracy(Some(5.0))));

    // Act
    let text = human_trackers(&[tracked.diagnostics(None)]);

    // Assert
    assert_eq!(text, "  101 quality=excellent failures=0 position=52.00000,5.00000\n");
}
