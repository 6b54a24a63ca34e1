use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, MutexGuard};

use crate::client::LocationSource;
use crate::coordinator::{Coordinator, DeviceMap};
use crate::failure::UpdateFailed;
use crate::model::Location;

/// Shared, cloneable access to one coordinator.
///
/// Refresh requests that arrive while a cycle is in flight wait for it and
/// receive its result instead of starting another fetch. The device map is
/// published outside the cycle lock, so readers never wait on a cycle.
pub struct CoordinatorHandle<S: LocationSource> {
    inner: Arc<Mutex<Coordinator<S>>>,
    completed: Arc<AtomicU64>,
    publisher: Arc<watch::Sender<DeviceMap>>,
}

impl<S: LocationSource> Clone for CoordinatorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            completed: Arc::clone(&self.completed),
            publisher: Arc::clone(&self.publisher),
        }
    }
}

impl<S: LocationSource> CoordinatorHandle<S> {
    pub fn new(coordinator: Coordinator<S>) -> Self {
        let (publisher, _) = watch::channel(coordinator.devices());
        Self {
            inner: Arc::new(Mutex::new(coordinator)),
            completed: Arc::new(AtomicU64::new(0)),
            publisher: Arc::new(publisher),
        }
    }

    pub async fn refresh(&self) -> Result<DeviceMap, UpdateFailed> {
        let seen = self.completed.load(Ordering::Acquire);
        let mut coordinator = self.inner.lock().await;
        if self.completed.load(Ordering::Acquire) != seen {
            if let Some(result) = coordinator.last_result() {
                return result;
            }
        }
        let result = coordinator.refresh().await;
        self.publisher.send_replace(coordinator.devices());
        self.completed.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// Last good device map, empty before the first successful cycle.
    pub fn devices(&self) -> DeviceMap {
        self.publisher.borrow().clone()
    }

    pub async fn get_device_location(&self, device_id: &str) -> Option<Location> {
        self.inner.lock().await.get_device_location(device_id).await
    }

    /// Exclusive access for configuration changes and diagnostics. Waits
    /// for any cycle in flight, including its cooldown.
    pub async fn lock(&self) -> MutexGuard<'_, Coordinator<S>> {
        self.inner.lock().await
    }

    /// Number of cycles that actually ran.
    pub fn cycles(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}
