use async_trait::async_trait;
use loca2_core::{Notification, Notifier, NotifyError, Severity};
use tracing::{info, warn};

/// Writes user notifications to the log. Stands in for a host UI.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn create(&self, notification: &Notification) -> Result<(), NotifyError> {
        let body = notification.message.replace('\n', " ");
        if notification.severity >= Severity::High {
            warn!(id = %notification.id, title = %notification.title, "{body}");
        } else {
            info!(id = %notification.id, title = %notification.title, "{body}");
        }
        Ok(())
    }

    async fn dismiss(&self, id: &str) -> Result<(), NotifyError> {
        tracing::debug!(id, "notification dismissed");
        Ok(())
    }
}
