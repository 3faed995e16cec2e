//! Data Update Coordinator
//!
//! Fetches data for a group of entities on a fixed interval. Only one
//! refresh runs at a time and timer cycles are sequential: the next sleep
//! starts after the previous refresh finished. Each refresh either replaces
//! the published data wholesale or keeps the previous data and records the
//! failure.
//!
//! Consumers watch a [`CoordinatorStatus`] through [`DataUpdateCoordinator::subscribe`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

/// A refresh failed; the previous data stays published
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct UpdateFailed(pub String);

impl UpdateFailed {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Produces a fresh data snapshot for a coordinator
#[async_trait]
pub trait UpdateMethod<T>: Send + Sync {
    async fn update(&self) -> Result<T, UpdateFailed>;
}

/// What a coordinator currently publishes
#[derive(Debug)]
pub struct CoordinatorStatus<T> {
    /// Last successfully fetched data
    pub data: Option<Arc<T>>,
    pub last_update_success: bool,
    pub last_error: Option<String>,
    /// Time of the last successful refresh
    pub last_update: Option<DateTime<Utc>>,
}

impl<T> Clone for CoordinatorStatus<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            last_update_success: self.last_update_success,
            last_error: self.last_error.clone(),
            last_update: self.last_update,
        }
    }
}

impl<T> Default for CoordinatorStatus<T> {
    fn default() -> Self {
        Self {
            data: None,
            last_update_success: true,
            last_error: None,
            last_update: None,
        }
    }
}

pub struct DataUpdateCoordinator<T> {
    name: String,
    /// `None` disables the timer; refreshes then only happen on request
    update_interval: Option<Duration>,
    method: Arc<dyn UpdateMethod<T>>,
    status: watch::Sender<CoordinatorStatus<T>>,
    refresh_lock: AsyncMutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> DataUpdateCoordinator<T> {
    pub fn new(
        name: impl Into<String>,
        update_interval: Option<Duration>,
        method: Arc<dyn UpdateMethod<T>>,
    ) -> Self {
        let (status, _) = watch::channel(CoordinatorStatus::default());
        Self {
            name: name.into(),
            update_interval,
            method,
            status,
            refresh_lock: AsyncMutex::new(()),
            timer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_interval(&self) -> Option<Duration> {
        self.update_interval
    }

    /// Latest published data
    pub fn data(&self) -> Option<Arc<T>> {
        self.status.borrow().data.clone()
    }

    pub fn last_update_success(&self) -> bool {
        self.status.borrow().last_update_success
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    pub fn status(&self) -> CoordinatorStatus<T> {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorStatus<T>> {
        self.status.subscribe()
    }

    /// Refresh once before entities are created
    ///
    /// The error is returned so setup can fail when the remote side is not
    /// reachable at startup.
    pub async fn first_refresh(&self) -> Result<(), UpdateFailed> {
        debug!("First refresh of {} data", self.name);
        self.refresh().await
    }

    /// Refresh now, waiting for an in-flight refresh to finish first
    pub async fn refresh(&self) -> Result<(), UpdateFailed> {
        let _guard = self.refresh_lock.lock().await;
        self.run_update().await
    }

    /// Refresh now unless a refresh is already running
    ///
    /// Returns whether a refresh was performed.
    pub async fn request_refresh(&self) -> bool {
        match self.refresh_lock.try_lock() {
            Ok(_guard) => {
                // Failures are already recorded in the status
                let _ = self.run_update().await;
                true
            }
            Err(_) => {
                debug!("Refresh of {} data already in progress", self.name);
                false
            }
        }
    }

    #[instrument(skip(self), fields(coordinator = %self.name))]
    async fn run_update(&self) -> Result<(), UpdateFailed> {
        let result = self.method.update().await;
        let was_failing = !self.status.borrow().last_update_success;

        match result {
            Ok(data) => {
                if was_failing {
                    info!("Fetching {} data recovered", self.name);
                }
                self.status.send_modify(|status| {
                    status.data = Some(Arc::new(data));
                    status.last_update_success = true;
                    status.last_error = None;
                    status.last_update = Some(Utc::now());
                });
                debug!("Finished fetching {} data", self.name);
                Ok(())
            }
            Err(err) => {
                // Once per failure streak
                if was_failing {
                    debug!("Error fetching {} data: {}", self.name, err);
                } else {
                    error!("Error fetching {} data: {}", self.name, err);
                }
                self.status.send_modify(|status| {
                    status.last_update_success = false;
                    status.last_error = Some(err.to_string());
                });
                Err(err)
            }
        }
    }

    /// Start the refresh timer
    ///
    /// Does nothing without an update interval or when already started.
    pub fn start(self: &Arc<Self>) {
        let Some(interval) = self.update_interval else {
            debug!("Polling disabled for {}", self.name);
            return;
        };

        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return;
        }

        let coordinator = Arc::downgrade(self);
        *timer = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                let _ = coordinator.refresh().await;
            }
        }));
        debug!("Refreshing {} data every {:?}", self.name, interval);
    }

    /// Stop the refresh timer
    pub fn shutdown(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.abort();
            debug!("Stopped refreshing {} data", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl<T> Drop for DataUpdateCoordinator<T> {
    fn drop(&mut self) {
        if let Some(timer) = self
            .timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts calls and fails while `fail` is set
    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
        fail: AtomicBool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl UpdateMethod<usize> for Counter {
        async fn update(&self) -> Result<usize, UpdateFailed> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail.load(Ordering::SeqCst) {
                return Err(UpdateFailed::new("boom"));
            }
            Ok(n)
        }
    }

    fn coordinator(
        counter: Arc<Counter>,
        interval: Option<Duration>,
    ) -> Arc<DataUpdateCoordinator<usize>> {
        Arc::new(DataUpdateCoordinator::<usize>::new("test", interval, counter))
    }

    #[tokio::test]
    async fn test_first_refresh_publishes_data() {
        let counter = Arc::new(Counter::default());
        let coordinator = coordinator(counter, None);

        assert!(coordinator.data().is_none());
        coordinator.first_refresh().await.unwrap();

        assert_eq!(coordinator.data().as_deref(), Some(&1));
        assert!(coordinator.last_update_success());
        assert!(coordinator.status().last_update.is_some());
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_data() {
        let counter = Arc::new(Counter::default());
        let coordinator = coordinator(counter.clone(), None);

        coordinator.refresh().await.unwrap();
        counter.fail.store(true, Ordering::SeqCst);
        let err = coordinator.refresh().await.unwrap_err();

        assert_eq!(err, UpdateFailed::new("boom"));
        assert_eq!(coordinator.data().as_deref(), Some(&1));
        assert!(!coordinator.last_update_success());
        assert_eq!(coordinator.last_error().as_deref(), Some("boom"));

        counter.fail.store(false, Ordering::SeqCst);
        coordinator.refresh().await.unwrap();
        assert_eq!(coordinator.data().as_deref(), Some(&3));
        assert!(coordinator.last_update_success());
        assert!(coordinator.last_error().is_none());
    }

    #[tokio::test]
    async fn test_first_refresh_failure() {
        let counter = Arc::new(Counter::default());
        counter.fail.store(true, Ordering::SeqCst);
        let coordinator = coordinator(counter, None);

        assert!(coordinator.first_refresh().await.is_err());
        assert!(coordinator.data().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let coordinator = coordinator(Arc::new(Counter::default()), None);
        let mut rx = coordinator.subscribe();

        coordinator.refresh().await.unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().data.as_deref(), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_refreshes_on_interval() {
        let counter = Arc::new(Counter::default());
        let coordinator = coordinator(counter.clone(), Some(Duration::from_secs(60)));

        coordinator.start();
        assert!(coordinator.is_running());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_timer() {
        let counter = Arc::new(Counter::default());
        let coordinator = coordinator(counter.clone(), Some(Duration::from_secs(10)));

        coordinator.start();
        tokio::time::sleep(Duration::from_secs(15)).await;
        coordinator.shutdown();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_disabled_without_interval() {
        let counter = Arc::new(Counter::default());
        let coordinator = coordinator(counter.clone(), None);

        coordinator.start();
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert!(!coordinator.is_running());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_refresh_in_flight() {
        let counter = Arc::new(Counter {
            delay: Some(Duration::from_secs(5)),
            ..Counter::default()
        });
        let coordinator = coordinator(counter.clone(), None);

        let background = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.refresh().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!coordinator.request_refresh().await);
        background.await.unwrap().unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

        assert!(coordinator.request_refresh().await);
        assert_eq!(counter.calls.load(Ordering::SeqCst), 2);
    }
}
