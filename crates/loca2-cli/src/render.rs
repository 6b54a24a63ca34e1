use std::fmt::Write as _;

use anyhow::Result;
use clap::ValueEnum;
use loca2_core::{DiagnosticSnapshot, Device, HealthCheckReport, Location, TrackerDiagnostics};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Ndjson,
}

/// Prints `value` as pretty JSON, one-line JSON, or the given human text.
pub fn emit<T, F>(value: &T, format: OutputFormat, human: F) -> Result<()>
where
    T: Serialize + ?Sized,
    F: FnOnce() -> String,
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Ndjson => println!("{}", serde_json::to_string(value)?),
        OutputFormat::Human => print!("{}", human()),
    }
    Ok(())
}

fn or_na<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "n/a".to_string())
}

pub fn human_devices(devices: &[&Device]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Loca2 Devices ({}) ===", devices.len());
    for device in devices {
        let _ = writeln!(out, "{} [{}] {}", device.id, device.device_type, device.name);
        let position = match (device.latitude, device.longitude) {
            (Some(lat), Some(lon)) => format!("{lat:.6}, {lon:.6}"),
            _ => "no fix".to_string(),
        };
        let _ = writeln!(out, "  Position:  {position}");
        if let Some(address) = device.location().and_then(|l| l.address) {
            let _ = writeln!(out, "  Address:   {address}");
        }
        let _ = writeln!(
            out,
            "  Battery:   {}  Online: {}  Last seen: {}",
            device
                .battery_level
                .map(|b| format!("{b}%"))
                .unwrap_or_else(|| "n/a".to_string()),
            device.is_online(),
            or_na(device.last_seen.map(|t| t.to_rfc3339()))
        );
    }
    out
}

pub fn human_location(device_id: &str, location: Option<&Location>) -> String {
    let Some(location) = location else {
        return format!("Device {device_id}: no location available\n");
    };
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Device {device_id}: {:.6}, {:.6}",
        location.latitude, location.longitude
    );
    let _ = writeln!(
        out,
        "  Accuracy:  {}",
        or_na(location.accuracy.map(|a| format!("{a:.0} m")))
    );
    let _ = writeln!(out, "  Time:      {}", or_na(location.timestamp.map(|t| t.to_rfc3339())));
    if let Some(address) = &location.address {
        let _ = writeln!(out, "  Address:   {address}");
    }
    out
}

pub fn human_snapshot(snapshot: &DiagnosticSnapshot) -> String {
    let status = &snapshot.coordinator;
    let limits = &snapshot.rate_limiting;
    let errors = &snapshot.error_tracking;
    let mut out = String::new();

    let _ = writeln!(out, "=== Loca2 Snapshot ===");
    let _ = writeln!(out, "Time:       {}", snapshot.timestamp.to_rfc3339());
    let _ = writeln!(
        out,
        "State:      success={} health={} devices={} updates={}",
        status.last_update_success, status.health_status, status.device_count, status.update_count
    );
    let _ = writeln!(
        out,
        "Polling:    interval={}s effective={}s next_in={:.0}s backoff=x{}",
        limits.current_scan_interval_secs,
        status.effective_interval_secs,
        status.next_run_in_secs,
        limits.backoff_multiplier
    );
    let _ = writeln!(
        out,
        "Errors:     consecutive={} total={} rate_1h={} rate_limits={} availability={:.1}%",
        limits.consecutive_errors,
        errors.total_errors,
        errors.error_rate_1h,
        limits.rate_limit_count,
        status.availability_24h
    );
    if let Some(last_error) = &status.last_error {
        let _ = writeln!(out, "Last Error: {last_error}");
    }
    if let Some(api) = &snapshot.api_client {
        let _ = writeln!(
            out,
            "API:        status={} health={} success_rate={:.1}% requests={}",
            api.connection_status, api.health_status, api.success_rate, api.total_requests
        );
    }
    out
}

pub fn human_health(report: &HealthCheckReport) -> String {
    let mark = |ok: bool| if ok { "pass" } else { "FAIL" };
    let mut out = String::new();
    let _ = writeln!(out, "=== Loca2 Health: {} ===", report.status());
    let _ = writeln!(out, "  api connection:     {}", mark(report.api_connectivity));
    let _ = writeln!(
        out,
        "  data freshness:     {} (age {})",
        mark(report.data_freshness),
        or_na(report.data_age_secs.map(|s| format!("{s:.0}s")))
    );
    let _ = writeln!(
        out,
        "  error rate (1h):    {} ({})",
        mark(report.error_rate_acceptable),
        report.error_rate_1h
    );
    let _ = writeln!(
        out,
        "  consecutive errors: {} ({})",
        mark(report.consecutive_errors_ok),
        report.consecutive_errors
    );
    out
}

pub fn human_trackers(trackers: &[TrackerDiagnostics]) -> String {
    let mut out = String::new();
    for t in trackers {
        let _ = writeln!(
            out,
            "  {} quality={} failures={} position={}",
            t.device_id,
            or_na(t.location_quality.map(|q| q.as_str())),
            t.consecutive_failures,
            match (t.latitude, t.longitude) {
                (Some(lat), Some(lon)) => format!("{lat:.5},{lon:.5}"),
                _ => "n/a".to_string(),
            }
        );
    }
    out
}
