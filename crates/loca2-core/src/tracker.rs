use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{Device, Location};

/// Location fetch failures in a row before the cached fix is dropped.
pub const MAX_LOCATION_FAILURES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationQuality {
    Invalid,
    Unknown,
    Excellent,
    Good,
    Fair,
    Poor,
}

impl LocationQuality {
    pub fn grade(location: &Location) -> Self {
        if !location.is_valid_coordinates() {
            return Self::Invalid;
        }
        match location.accuracy {
            None => Self::Unknown,
            Some(m) if m <= 10.0 => Self::Excellent,
            Some(m) if m <= 50.0 => Self::Good,
            Some(m) if m <= 100.0 => Self::Fair,
            Some(_) => Self::Poor,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Unknown => "unknown",
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerDiagnostics {
    pub device_id: String,
    pub has_location: bool,
    pub consecutive_failures: u32,
    pub last_location_update: Option<DateTime<Utc>>,
    pub location_quality: Option<LocationQuality>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub online: Option<bool>,
}

/// Per-device view kept across cycles: the last good fix plus a failure
/// streak. Coordinates from the live device record win over the cache.
#[derive(Debug, Clone)]
pub struct TrackedDevice {
    device_id: String,
    location: Option<Location>,
    consecutive_failures: u32,
    last_location_update: Option<DateTime<Utc>>,
}

impl TrackedDevice {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            location: None,
            consecutive_failures: 0,
            last_location_update: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_location_update(&self) -> Option<DateTime<Utc>> {
        self.last_location_update
    }

    /// Feeds the outcome of one location lookup.
    pub fn record_location(&mut self, fetched: Option<Location>) {
        match fetched {
            Some(location) => {
                if LocationQuality::grade(&location) == LocationQuality::Poor {
                    warn!(
                        device = %self.device_id,
                        accuracy = location.accuracy,
                        "poor location accuracy"
                    );
                }
                self.location = Some(location);
                self.consecutive_failures = 0;
                self.last_location_update = Some(Utc::now());
            }
            None => {
                self.consecutive_failures += 1;
                debug!(
                    device = %self.device_id,
                    failures = self.consecutive_failures,
                    "no location returned"
                );
                if self.consecutive_failures >= MAX_LOCATION_FAILURES && self.location.is_some() {
                    warn!(
                        device = %self.device_id,
                        failures = self.consecutive_failures,
                        "too many location failures, discarding cached location"
                    );
                    self.location = None;
                }
            }
        }
    }

    pub fn latitude(&self, live: Option<&Device>) -> Option<f64> {
        live.and_then(|d| d.latitude)
            .or_else(|| self.location.as_ref().map(|l| l.latitude))
    }

    pub fn longitude(&self, live: Option<&Device>) -> Option<f64> {
        live.and_then(|d| d.longitude)
            .or_else(|| self.location.as_ref().map(|l| l.longitude))
    }

    pub fn accuracy(&self, live: Option<&Device>) -> Option<f64> {
        live.and_then(|d| d.gps_accuracy)
            .or_else(|| self.location.as_ref().and_then(|l| l.accuracy))
    }

    pub fn quality(&self) -> Option<LocationQuality> {
        self.location.as_ref().map(LocationQuality::grade)
    }

    pub fn diagnostics(&self, live: Option<&Device>) -> TrackerDiagnostics {
        TrackerDiagnostics {
            device_id: self.device_id.clone(),
            has_location: self.location.is_some(),
            consecutive_failures: self.consecutive_failures,
            last_location_update: self.last_location_update,
            location_quality: self.quality(),
            latitude: self.latitude(live),
            longitude: self.longitude(live),
            accuracy: self.accuracy(live),
            online: live.map(Device::is_online),
        }
    }
}

/// Trackers for every device seen in the latest cycle.
#[derive(Debug, Clone, Default)]
pub struct TrackerSet {
    trackers: BTreeMap<String, TrackedDevice>,
}

impl TrackerSet {
    pub fn get(&self, device_id: &str) -> Option<&TrackedDevice> {
        self.trackers.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Feeds a successful cycle. Devices that left the account are dropped.
    pub fn record_cycle(&mut self, devices: &BTreeMap<String, Device>) {
        for device in devices.values() {
            self.trackers
                .entry(device.id.clone())
                .or_insert_with(|| TrackedDevice::new(device.id.clone()))
                .record_location(device.location());
        }
        self.trackers.retain(|id, _| devices.contains_key(id));
    }

    /// A failed cycle is a failed location lookup for every known device.
    pub fn record_failed_cycle(&mut self) {
        for tracker in self.trackers.values_mut() {
            tracker.record_location(None);
        }
    }

    pub fn diagnostics(&self, devices: &BTreeMap<String, Device>) -> Vec<TrackerDiagnostics> {
        self.trackers
            .values()
            .map(|t| t.diagnostics(devices.get(t.device_id())))
            .collect()
    }
}
