use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, COOKIE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::health::HealthStatus;
use crate::model::{parse_devices, Device, Location};

pub const AUTH_ENDPOINT: &str = "/apilogin";
pub const ASSET_STATUS_ENDPOINT: &str = "/assetstatuslist";
const SESSION_COOKIE: &str = "sid";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limit exceeded{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("api error{}: {message}", status_hint(.status))]
    Api { status: Option<u16>, message: String },
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!(", retry after {}s", wait.as_secs()),
        None => String::new(),
    }
}

fn status_hint(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Unknown,
    Connected,
    AuthFailed,
    RateLimited,
    ApiError,
    Timeout,
    ConnectionError,
    UnknownError,
    MaxRetriesExceeded,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Connected => "connected",
            Self::AuthFailed => "auth_failed",
            Self::RateLimited => "rate_limited",
            Self::ApiError => "api_error",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection_error",
            Self::UnknownError => "unknown_error",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the client's request bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDiagnostics {
    pub connection_status: ConnectionStatus,
    pub health_status: HealthStatus,
    pub last_error: Option<String>,
    pub error_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub success_rate: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_response_secs: Option<f64>,
    pub endpoint: String,
    pub timeout_secs: f64,
    pub session_active: bool,
    pub timestamp: DateTime<Utc>,
}

/// Upstream the coordinator polls. `Loca2Client` is the production source.
#[async_trait]
pub trait LocationSource: Send {
    async fn authenticate(&mut self) -> Result<(), ApiError>;
    async fn fetch_devices(&mut self) -> Result<Vec<Device>, ApiError>;

    async fn fetch_device_location(&mut self, device_id: &str) -> Result<Location, ApiError> {
        let devices = self.fetch_devices().await?;
        find_location(&devices, device_id)
    }

    async fn test_connection(&mut self) -> bool {
        match self.authenticate().await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "connection test failed");
                false
            }
        }
    }

    async fn close(&mut self) {}

    fn diagnostics(&self) -> Option<ClientDiagnostics> {
        None
    }
}

/// Picks one device's location out of an already fetched batch.
pub fn find_location(devices: &[Device], device_id: &str) -> Result<Location, ApiError> {
    let device = devices
        .iter()
        .find(|d| d.id == device_id)
        .ok_or_else(|| ApiError::Api {
            status: None,
            message: format!("device {device_id} not found"),
        })?;
    device.location().ok_or_else(|| ApiError::Api {
        status: None,
        message: format!("no location data available for device {device_id}"),
    })
}

enum AttemptError {
    /// Transport failure; the retry loop may try again.
    Transient(String),
    Fatal(ApiError),
}

pub struct Loca2Client {
    http: reqwest::Client,
    config: ClientConfig,
    session: Option<String>,
    status: ConnectionStatus,
    last_error: Option<String>,
    error_count: u64,
    total_requests: u64,
    successful_requests: u64,
    last_success: Option<DateTime<Utc>>,
    last_response_time: Option<Duration>,
}

impl Loca2Client {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        config
            .validate()
            .map_err(|err| ApiError::Unexpected(err.to_string()))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| ApiError::Unexpected(format!("http client: {err}")))?;

        Ok(Self {
            http,
            config,
            session: None,
            status: ConnectionStatus::Unknown,
            last_error: None,
            error_count: 0,
            total_requests: 0,
            successful_requests: 0,
            last_success: None,
            last_response_time: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.status
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Posts the credentials and stores the `sid` session cookie. Failures
    /// land in the diagnostics like any other request failure.
    pub async fn authenticate(&mut self) -> Result<(), ApiError> {
        let result = match timeout(self.config.request_timeout, self.login()).await {
            Ok(result) => result,
            Err(_) => {
                let err = ApiError::Connection(format!(
                    "authentication timed out after {:.1}s",
                    self.config.request_timeout.as_secs_f64()
                ));
                self.record_fatal(&err);
                self.status = ConnectionStatus::Timeout;
                return Err(err);
            }
        };

        match result {
            Ok(sid) => {
                debug!("authenticated, session cookie received");
                self.session = Some(sid);
                Ok(())
            }
            Err(err) => {
                self.session = None;
                self.record_fatal(&err);
                Err(err)
            }
        }
    }

    async fn login(&self) -> Result<String, ApiError> {
        let url = self.url(AUTH_ENDPOINT);
        let form = [
            ("account", self.config.account.as_str()),
            ("password", self.config.password.as_str()),
        ];

        let response = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|err| ApiError::Connection(format!("authentication request failed: {err}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Auth("invalid account or password".to_string()));
        }
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Api {
                status: Some(status.as_u16()),
                message: format!("authentication rejected: {body}"),
            });
        }

        let session = response
            .cookies()
            .find(|c| c.name() == SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or_else(|| {
                ApiError::Auth("no session cookie received after authentication".to_string())
            });
        session
    }

    /// Issues one logical request with bounded retries. Logs in first when
    /// there is no session.
    pub async fn request(&mut self, method: Method, path: &str) -> Result<Value, ApiError> {
        self.total_requests += 1;
        if path != AUTH_ENDPOINT && self.session.is_none() {
            self.authenticate().await?;
        }

        let url = self.url(path);
        let attempts = self.config.max_attempts.max(1);
        let started = Instant::now();
        let mut last_failure = String::new();

        for attempt in 0..attempts {
            let attempt_started = Instant::now();
            let outcome = timeout(
                self.config.request_timeout,
                self.attempt(method.clone(), &url),
            )
            .await;
            let elapsed = attempt_started.elapsed();

            match outcome {
                Ok(Ok((status, body))) => {
                    self.record_success(elapsed);
                    if elapsed > self.config.slow_response_threshold {
                        warn!(
                            %method,
                            path,
                            secs = elapsed.as_secs_f64(),
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            "slow api response"
                        );
                    } else {
                        debug!(
                            %method,
                            path,
                            secs = elapsed.as_secs_f64(),
                            status = status.as_u16(),
                            "request completed"
                        );
                    }
                    return Ok(body);
                }
                Ok(Err(AttemptError::Fatal(err))) => {
                    self.record_fatal(&err);
                    return Err(err);
                }
                Ok(Err(AttemptError::Transient(reason))) => {
                    self.status = ConnectionStatus::ConnectionError;
                    self.error_count += 1;
                    warn!(
                        %method,
                        path,
                        attempt = attempt + 1,
                        attempts,
                        error = %reason,
                        "request failed"
                    );
                    last_failure = reason;
                }
                Err(_) => {
                    self.status = ConnectionStatus::Timeout;
                    self.error_count += 1;
                    last_failure = format!("request timed out after {:.1}s", elapsed.as_secs_f64());
                    warn!(
                        %method,
                        path,
                        attempt = attempt + 1,
                        attempts,
                        secs = elapsed.as_secs_f64(),
                        "request timed out"
                    );
                }
            }
            self.last_error = Some(last_failure.clone());

            if attempt + 1 < attempts {
                let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt);
                debug!(delay_secs = delay.as_secs_f64(), "retrying request");
                sleep(delay).await;
            }
        }

        let total = started.elapsed().as_secs_f64();
        self.status = ConnectionStatus::MaxRetriesExceeded;
        error!(%method, path, attempts, total_secs = total, "all retry attempts failed");
        Err(ApiError::Connection(format!(
            "{last_failure} (gave up after {attempts} attempts, {total:.1}s)"
        )))
    }

    async fn attempt(&self, method: Method, url: &str) -> Result<(StatusCode, Value), AttemptError> {
        let mut builder = self
            .http
            .request(method, url)
            .header(ACCEPT, "application/json");
        if let Some(sid) = &self.session {
            builder = builder.header(COOKIE, format!("{SESSION_COOKIE}={sid}"));
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_builder() {
                AttemptError::Fatal(ApiError::Unexpected(err.to_string()))
            } else {
                AttemptError::Transient(format!("connection failed: {err}"))
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AttemptError::Fatal(ApiError::Auth(
                "session rejected (HTTP 401)".to_string(),
            )));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AttemptError::Fatal(ApiError::RateLimited { retry_after }));
        }
        if status.is_client_error() || status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(AttemptError::Fatal(ApiError::Api {
                status: Some(status.as_u16()),
                message: text,
            }));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| AttemptError::Transient(format!("failed to read response body: {err}")))?;
        let body = serde_json::from_slice(&bytes).map_err(|err| {
            AttemptError::Fatal(ApiError::Api {
                status: Some(status.as_u16()),
                message: format!("invalid JSON response: {err}"),
            })
        })?;
        Ok((status, body))
    }

    fn record_success(&mut self, elapsed: Duration) {
        self.status = ConnectionStatus::Connected;
        self.successful_requests += 1;
        self.last_success = Some(Utc::now());
        self.last_response_time = Some(elapsed);
        self.last_error = None;
    }

    fn record_fatal(&mut self, err: &ApiError) {
        self.error_count += 1;
        self.last_error = Some(err.to_string());
        self.status = match err {
            ApiError::Auth(_) => {
                // Force a fresh login on the next request.
                self.session = None;
                ConnectionStatus::AuthFailed
            }
            ApiError::RateLimited { .. } => ConnectionStatus::RateLimited,
            ApiError::Api { .. } => ConnectionStatus::ApiError,
            ApiError::Connection(_) => ConnectionStatus::ConnectionError,
            ApiError::Unexpected(_) => ConnectionStatus::UnknownError,
        };
        match err {
            ApiError::RateLimited { retry_after } => warn!(
                retry_after_secs = retry_after.map(|d| d.as_secs()),
                "rate limited by upstream"
            ),
            other => warn!(error = %other, "request rejected"),
        }
    }

    /// Fetches the asset status list and returns every record that parses.
    pub async fn get_devices(&mut self) -> Result<Vec<Device>, ApiError> {
        let body = self.request(Method::GET, ASSET_STATUS_ENDPOINT).await?;
        match body {
            Value::Array(records) => {
                let devices = parse_devices(&records);
                debug!(count = devices.len(), "retrieved devices");
                Ok(devices)
            }
            other => {
                warn!(kind = json_kind(&other), "expected a list from the asset status endpoint");
                Ok(Vec::new())
            }
        }
    }

    /// Served from the same batch fetch as `get_devices`.
    pub async fn get_device_location(&mut self, device_id: &str) -> Result<Location, ApiError> {
        let devices = self.get_devices().await?;
        find_location(&devices, device_id)
    }

    pub async fn test_connection(&mut self) -> bool {
        match self.authenticate().await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "connection test failed");
                false
            }
        }
    }

    pub fn close(&mut self) {
        if self.session.take().is_some() {
            debug!("session closed");
        }
    }

    pub fn diagnostics(&self) -> ClientDiagnostics {
        let success_rate = if self.total_requests > 0 {
            self.successful_requests as f64 / self.total_requests as f64 * 100.0
        } else {
            0.0
        };

        ClientDiagnostics {
            connection_status: self.status,
            health_status: client_health(success_rate, self.status),
            last_error: self.last_error.clone(),
            error_count: self.error_count,
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            success_rate,
            last_success: self.last_success,
            last_response_secs: self.last_response_time.map(|d| d.as_secs_f64()),
            endpoint: self.config.base_url.clone(),
            timeout_secs: self.config.request_timeout.as_secs_f64(),
            session_active: self.session.is_some(),
            timestamp: Utc::now(),
        }
    }

    pub fn reset_diagnostic_counters(&mut self) {
        info!("resetting api client diagnostic counters");
        self.error_count = 0;
        self.total_requests = 0;
        self.successful_requests = 0;
    }
}

#[async_trait]
impl LocationSource for Loca2Client {
    async fn authenticate(&mut self) -> Result<(), ApiError> {
        Loca2Client::authenticate(self).await
    }

    async fn fetch_devices(&mut self) -> Result<Vec<Device>, ApiError> {
        self.get_devices().await
    }

    async fn fetch_device_location(&mut self, device_id: &str) -> Result<Location, ApiError> {
        self.get_device_location(device_id).await
    }

    async fn test_connection(&mut self) -> bool {
        Loca2Client::test_connection(self).await
    }

    async fn close(&mut self) {
        Loca2Client::close(self);
    }

    fn diagnostics(&self) -> Option<ClientDiagnostics> {
        Some(Loca2Client::diagnostics(self))
    }
}

fn client_health(success_rate: f64, status: ConnectionStatus) -> HealthStatus {
    match status {
        ConnectionStatus::Connected if success_rate >= 95.0 => HealthStatus::Healthy,
        ConnectionStatus::Connected | ConnectionStatus::ApiError if success_rate >= 80.0 => {
            HealthStatus::Degraded
        }
        _ => HealthStatus::Unhealthy,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
