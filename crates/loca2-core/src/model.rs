//! Device and location records decoded from the `/assetstatuslist` payload.
//!
//! Two parsing paths exist on purpose with different strictness:
//! [`Device::from_value`] keeps a record alive and drops individual bad
//! fields, while [`Location::from_value`] rejects anything it cannot trust.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_ONLINE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const EARTH_RADIUS_M: f64 = 6_371_000.0;
const MILLIS_THRESHOLD: f64 = 1e10;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing {0} section")]
    MissingSection(&'static str),
    #[error("missing or empty field {0}")]
    MissingField(&'static str),
    #[error("{field} is not numeric: {value}")]
    NotNumeric { field: &'static str, value: String },
    #[error("{field} {value} is outside valid range ({min} to {max})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub device_type: String,
    pub serial: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub group: Option<i64>,
    pub asset_type_id: Option<i64>,

    pub hardware_id: Option<i64>,
    pub hardware_type_id: Option<i64>,
    pub hardware_version: Option<i64>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub zipcode: Option<String>,
    pub location_time: Option<DateTime<Utc>>,

    pub battery_level: Option<u8>,
    pub last_seen: Option<DateTime<Utc>>,
    pub speed: Option<f64>,
    pub motion: Option<i64>,
    pub signal_strength: Option<i64>,
    pub gps_accuracy: Option<f64>,
    pub satellites: Option<i64>,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Result<Self, ParseError> {
        let device = Self {
            id: id.into().trim().to_string(),
            name: name.into().trim().to_string(),
            device_type: device_type_name(None),
            serial: None,
            brand: None,
            model: None,
            group: None,
            asset_type_id: None,
            hardware_id: None,
            hardware_type_id: None,
            hardware_version: None,
            latitude: None,
            longitude: None,
            address: None,
            city: None,
            state: None,
            country: None,
            zipcode: None,
            location_time: None,
            battery_level: None,
            last_seen: None,
            speed: None,
            motion: None,
            signal_strength: None,
            gps_accuracy: None,
            satellites: None,
        };
        device.validate()?;
        Ok(device)
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if self.id.is_empty() {
            return Err(ParseError::MissingField("Asset.id"));
        }
        if self.name.is_empty() {
            return Err(ParseError::MissingField("Asset.label"));
        }
        if let Some(level) = self.battery_level {
            if level > 100 {
                return Err(ParseError::OutOfRange {
                    field: "battery_level",
                    value: f64::from(level),
                    min: 0.0,
                    max: 100.0,
                });
            }
        }
        Ok(())
    }

    /// Builds a device from one element of the asset status list.
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        let record = value.as_object().ok_or(ParseError::NotAnObject)?;
        let asset = section(record, "Asset").ok_or(ParseError::MissingSection("Asset"))?;

        let id = asset
            .get("id")
            .and_then(scalar_to_string)
            .ok_or(ParseError::MissingField("Asset.id"))?;
        let name = asset
            .get("label")
            .and_then(scalar_to_string)
            .unwrap_or_else(|| format!("Asset {id}"));
        let asset_type_id = asset.get("type").and_then(value_as_i64);

        let mut device = Self::new(id, name)?;
        device.device_type = device_type_name(asset_type_id);
        device.asset_type_id = asset_type_id;
        device.serial = asset.get("serial").and_then(scalar_to_string);
        device.brand = asset.get("brand").and_then(scalar_to_string);
        device.model = asset.get("model").and_then(scalar_to_string);
        device.group = asset.get("group").and_then(value_as_i64);

        if let Some(hardware) = section(record, "Device") {
            device.hardware_id = hardware.get("id").and_then(value_as_i64);
            device.hardware_type_id = hardware.get("type").and_then(value_as_i64);
            device.hardware_version = hardware.get("version").and_then(value_as_i64);
        }

        if let Some(spot) = section(record, "Spot") {
            if let Some((lat, lon)) = lenient_coordinates(spot, &device.id) {
                device.latitude = Some(lat);
                device.longitude = Some(lon);
            }
            device.location_time = spot.get("time").and_then(parse_unix_timestamp);

            let street_parts: Vec<String> = ["street", "number"]
                .iter()
                .filter_map(|key| spot.get(*key).and_then(scalar_to_string))
                .collect();
            if !street_parts.is_empty() {
                device.address = Some(street_parts.join(" "));
            }
            device.city = spot.get("city").and_then(scalar_to_string);
            device.state = spot.get("state").and_then(scalar_to_string);
            device.country = spot.get("country").and_then(scalar_to_string);
            device.zipcode = spot.get("zipcode").and_then(scalar_to_string);
        }

        if let Some(history) = section(record, "History") {
            device.battery_level = history.get("charge").and_then(parse_battery);
            device.last_seen = history.get("time").and_then(parse_unix_timestamp);
            device.speed = history.get("speed").and_then(value_as_f64);
            device.motion = history.get("motion").and_then(value_as_i64);
            device.signal_strength = history.get("strength").and_then(value_as_i64);
            device.gps_accuracy = history.get("HDOP").and_then(value_as_f64);
            device.satellites = history.get("SATU").and_then(value_as_i64);
        }

        Ok(device)
    }

    /// Renders the device back into the upstream nested shape.
    pub fn to_asset_status(&self) -> Value {
        json!({
            "Asset": {
                "id": self.id,
                "label": self.name,
                "type": self.asset_type_id,
                "serial": self.serial,
                "brand": self.brand,
                "model": self.model,
                "group": self.group,
            },
            "Device": {
                "id": self.hardware_id,
                "type": self.hardware_type_id,
                "version": self.hardware_version,
            },
            "Spot": {
                "latitude": self.latitude,
                "longitude": self.longitude,
                "time": self.location_time.map(|t| t.timestamp_millis()),
                "street": self.address,
                "city": self.city,
                "state": self.state,
                "country": self.country,
                "zipcode": self.zipcode,
            },
            "History": {
                "charge": self.battery_level,
                "time": self.last_seen.map(|t| t.timestamp_millis()),
                "speed": self.speed,
                "motion": self.motion,
                "strength": self.signal_strength,
                "HDOP": self.gps_accuracy,
                "SATU": self.satellites,
            },
        })
    }

    pub fn is_online(&self) -> bool {
        self.is_online_at(Utc::now(), DEFAULT_ONLINE_TIMEOUT)
    }

    pub fn is_online_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let (Some(last_seen), Ok(timeout)) = (self.last_seen, chrono::Duration::from_std(timeout))
        else {
            return false;
        };
        now - last_seen <= timeout
    }

    /// Location view of the device, if it carries a coordinate fix.
    pub fn location(&self) -> Option<Location> {
        let (latitude, longitude) = (self.latitude?, self.longitude?);

        let parts: Vec<&str> = [&self.address, &self.city, &self.state, &self.country]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .collect();
        let address = (!parts.is_empty()).then(|| parts.join(", "));

        Location::new(latitude, longitude)
            .ok()
            .map(|loc| {
                loc.with_accuracy(self.gps_accuracy)
                    .with_timestamp(self.location_time.or(self.last_seen))
                    .with_address(address)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub address: Option<String>,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ParseError> {
        Ok(Self {
            latitude: check_range(latitude, "latitude", -90.0, 90.0)?,
            longitude: check_range(longitude, "longitude", -180.0, 180.0)?,
            accuracy: None,
            timestamp: None,
            address: None,
        })
    }

    pub fn with_accuracy(mut self, accuracy: Option<f64>) -> Self {
        self.accuracy = accuracy.filter(|a| a.is_finite()).map(clamp_accuracy);
        self
    }

    pub fn with_timestamp(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_address(mut self, address: Option<String>) -> Self {
        self.address = address
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        self
    }

    /// Strict constructor from explicit `latitude`/`longitude` fields.
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        let data = value.as_object().ok_or(ParseError::NotAnObject)?;

        let latitude = strict_coordinate(data.get("latitude"), "latitude", -90.0, 90.0)?;
        let longitude = strict_coordinate(data.get("longitude"), "longitude", -180.0, 180.0)?;

        let timestamp = match data.get("timestamp") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => parse_datetime(raw),
            Some(other) => {
                warn!(value = %other, "invalid location timestamp format (not a string)");
                None
            }
        };

        let address = data.get("address").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(_) | Value::Bool(_) => Some(v.to_string()),
            _ => None,
        });

        Ok(Self {
            latitude,
            longitude,
            accuracy: None,
            timestamp,
            address: None,
        }
        .with_accuracy(data.get("accuracy").and_then(parse_accuracy))
        .with_address(address))
    }

    pub fn to_value(&self) -> Value {
        json!({
            "latitude": self.latitude,
            "longitude": self.longitude,
            "accuracy": self.accuracy,
            "timestamp": self
                .timestamp
                .map(|t| t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            "address": self.address,
        })
    }

    /// `(0, 0)` is what trackers report when they have no fix.
    pub fn is_valid_coordinates(&self) -> bool {
        !(self.latitude == 0.0 && self.longitude == 0.0)
    }

    /// Great-circle distance in metres.
    pub fn distance_to(&self, other: &Location) -> f64 {
        let (lat1, lon1) = (self.latitude.to_radians(), self.longitude.to_radians());
        let (lat2, lon2) = (other.latitude.to_radians(), other.longitude.to_radians());

        let dlat = lat2 - lat1;
        let dlon = lon2 - lon1;
        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * a.sqrt().asin() * EARTH_RADIUS_M
    }
}

/// Parses every record, keeping the valid subset.
pub fn parse_devices(records: &[Value]) -> Vec<Device> {
    let mut devices = Vec::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        match Device::from_value(record) {
            Ok(device) => devices.push(device),
            Err(err) => warn!(index = idx, error = %err, "skipping invalid asset status record"),
        }
    }
    debug!(parsed = devices.len(), total = records.len(), "parsed asset status list");
    devices
}

pub fn device_type_name(type_id: Option<i64>) -> String {
    match type_id {
        None | Some(0) => "unknown".to_string(),
        Some(1) => "gps_tracker".to_string(),
        Some(2) => "marine_tracker".to_string(),
        Some(3) => "vehicle_tracker".to_string(),
        Some(4) => "personal_tracker".to_string(),
        Some(5) => "asset_tracker".to_string(),
        Some(other) => format!("tracker_type_{other}"),
    }
}

/// Battery percentage from an int, float or `"85%"`-style string.
pub fn parse_battery(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::Null => return None,
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let trimmed = s.trim();
            let trimmed = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<f64>() {
                Ok(v) => v,
                Err(_) => {
                    warn!(value = %s, "invalid battery level format");
                    return None;
                }
            }
        }
        other => {
            warn!(value = %other, "invalid battery level type");
            return None;
        }
    };

    if !raw.is_finite() {
        return None;
    }

    let level = raw.trunc() as i64;
    if !(0..=100).contains(&level) {
        warn!(battery = level, "battery level outside valid range (0-100), clamping");
    }
    Some(level.clamp(0, 100) as u8)
}

/// Unix seconds or milliseconds (values above 1e10), as number or string.
pub fn parse_unix_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(int) => from_unix_int(int),
            None => from_unix_float(n.as_f64()?),
        },
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => from_unix_int(v as i64),
            Ok(v) => from_unix_float(v),
            Err(_) => parse_datetime(s),
        },
        _ => None,
    }
}

/// Tries RFC 3339 first, then naive `T`/space separated forms, then a bare date.
/// Naive values are taken as UTC.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    warn!(value, "could not parse datetime");
    None
}

fn from_unix_int(value: i64) -> Option<DateTime<Utc>> {
    if value as f64 > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

fn from_unix_float(mut secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    if secs > MILLIS_THRESHOLD {
        secs /= 1000.0;
    }
    let whole = secs.floor();
    let nanos = (((secs - whole) * 1e9).round() as u32).min(999_999_999);
    DateTime::from_timestamp(whole as i64, nanos)
}

fn section<'a>(record: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    record
        .get(key)
        .and_then(Value::as_object)
        .filter(|m| !m.is_empty())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    let parsed: Option<f64> = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn parse_accuracy(value: &Value) -> Option<f64> {
    let accuracy = match value {
        Value::Null => return None,
        Value::String(s) if s.trim().is_empty() => return None,
        Value::Number(_) | Value::String(_) => value_as_f64(value),
        _ => None,
    };
    if accuracy.is_none() {
        warn!(value = %value, "invalid accuracy format");
    }
    accuracy
}

fn clamp_accuracy(accuracy: f64) -> f64 {
    if accuracy < 0.0 {
        warn!(accuracy, "negative accuracy value, setting to 0");
        return 0.0;
    }
    accuracy
}

fn check_range(value: f64, field: &'static str, min: f64, max: f64) -> Result<f64, ParseError> {
    if !value.is_finite() {
        return Err(ParseError::NotNumeric {
            field,
            value: value.to_string(),
        });
    }
    if !(min..=max).contains(&value) {
        return Err(ParseError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn strict_coordinate(
    value: Option<&Value>,
    field: &'static str,
    min: f64,
    max: f64,
) -> Result<f64, ParseError> {
    let parsed = match value {
        None | Some(Value::Null) => return Err(ParseError::MissingField(field)),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            if s.trim().is_empty() {
                return Err(ParseError::MissingField(field));
            }
            s.trim().parse::<f64>().ok()
        }
        Some(_) => None,
    };

    let Some(coord) = parsed else {
        return Err(ParseError::NotNumeric {
            field,
            value: value.map(Value::to_string).unwrap_or_default(),
        });
    };
    check_range(coord, field, min, max)
}

fn lenient_coordinates(spot: &Map<String, Value>, device_id: &str) -> Option<(f64, f64)> {
    let lat = spot.get("latitude").filter(|v| !v.is_null());
    let lon = spot.get("longitude").filter(|v| !v.is_null());
    if lat.is_none() && lon.is_none() {
        return None;
    }

    let parsed = strict_coordinate(lat, "latitude", -90.0, 90.0)
        .and_then(|lat| Ok((lat, strict_coordinate(lon, "longitude", -180.0, 180.0)?)));
    match parsed {
        Ok(pair) => Some(pair),
        Err(err) => {
            warn!(device_id, error = %err, "dropping invalid coordinates");
            None
        }
    }
}
