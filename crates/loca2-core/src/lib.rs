pub mod client;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod failure;
pub mod handle;
pub mod health;
pub mod model;
pub mod notify;
pub mod snapshot;
pub mod tracker;

#[cfg(test)]
mod coordinator_tests;

pub use client::{ApiError, ClientDiagnostics, ConnectionStatus, Loca2Client, LocationSource};
pub use config::{ClientConfig, ConfigError, CoordinatorConfig};
pub use coordinator::{Coordinator, DeviceMap};
pub use diagnostics::{format_diagnostic_summary, DiagnosticCollector, StructuredLogger};
pub use failure::{ErrorCategory, ErrorRecord, FailureKind, Severity, UpdateFailed};
pub use handle::CoordinatorHandle;
pub use health::{HealthCheckReport, HealthStatus};
pub use model::{parse_devices, Device, Location, ParseError};
pub use notify::{Notification, Notifier, NotifyError, NullNotifier};
pub use snapshot::DiagnosticSnapshot;
pub use tracker::{LocationQuality, TrackedDevice, TrackerDiagnostics, TrackerSet};
