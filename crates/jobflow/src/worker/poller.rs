//! Job polling with exponential backoff
//!
//! Claims batches of eligible jobs and adapts the polling cadence: an
//! empty poll stretches the interval, a productive poll snaps it back
//! to the minimum.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::clock::Clock;
use crate::job::{Job, JobKind};
use crate::lease::LeaseManager;
use crate::persistence::{JobStore, StoreError};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when jobs are available)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no jobs found
    pub backoff_multiplier: f64,

    /// Maximum jobs to claim per poll
    pub batch_size: usize,

    /// Lease stamped on each claimed job
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
            lease_duration: Duration::from_secs(300),
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the lease duration stamped on claimed jobs
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }
}

/// Job poller with adaptive backoff
pub struct JobPoller {
    leases: LeaseManager,
    worker_id: String,
    kind: JobKind,
    topic: Option<String>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl JobPoller {
    /// Create a new job poller
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        worker_id: String,
        kind: JobKind,
        topic: Option<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            leases: LeaseManager::new(store, clock),
            worker_id,
            kind,
            topic,
            config: config.clone(),
            current_interval: config.min_interval,
            shutdown_rx,
        }
    }

    /// Poll once for eligible jobs
    ///
    /// Claimed jobs come back leased to this poller's worker id.
    /// Updates the internal backoff state. Fails with
    /// [`PollerError::Shutdown`] once shutdown has been signaled.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_jobs: usize) -> Result<Vec<Job>, PollerError> {
        if *self.shutdown_rx.borrow() {
            debug!("Poller shutdown requested");
            return Err(PollerError::Shutdown);
        }

        let batch_size = max_jobs.min(self.config.batch_size);

        let jobs = self
            .leases
            .acquire_and_lock(
                self.kind,
                self.topic.as_deref(),
                batch_size,
                &self.worker_id,
                self.config.lease_duration,
            )
            .await
            .map_err(PollerError::Store)?;

        if jobs.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "No jobs found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = jobs.len(), "Claimed jobs");
        }

        Ok(jobs)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns true if shutdown was signaled during the wait.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker shutdown
    #[error("worker is shutting down")]
    Shutdown,
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::InMemoryJobStore;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(5));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.lease_duration, Duration::from_secs(300));
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(2.0)
            .with_batch_size(20)
            .with_lease_duration(Duration::from_secs(60));

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.lease_duration, Duration::from_secs(60));
    }

    fn poller(
        store: Arc<InMemoryJobStore>,
        clock: Arc<ManualClock>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JobPoller {
        JobPoller::new(
            store,
            clock,
            "w1".to_string(),
            JobKind::ExternalWorker,
            Some("payments".to_string()),
            PollerConfig::default(),
            shutdown_rx,
        )
    }

    #[tokio::test]
    async fn test_empty_poll_backs_off_and_claim_resets() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let (_tx, rx) = watch::channel(false);
        let mut poller = poller(store.clone(), clock, rx);

        assert!(poller.poll(10).await.unwrap().is_empty());
        assert!(poller.current_interval() > Duration::from_millis(100));

        let job = Job::new(JobKind::ExternalWorker, "payments", serde_json::json!({}));
        store.insert(&job).await.unwrap();

        let claimed = poller.poll(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].lock_owner.as_deref(), Some("w1"));
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_backoff_capped_at_max() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock));
        let (_tx, rx) = watch::channel(false);
        let mut poller = JobPoller::new(
            store,
            Arc::new(ManualClock::starting_now()),
            "w1".to_string(),
            JobKind::ExternalWorker,
            None,
            PollerConfig::default().with_max_interval(Duration::from_millis(300)),
            rx,
        );

        for _ in 0..20 {
            poller.poll(10).await.unwrap();
        }
        assert_eq!(poller.current_interval(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let job = Job::new(JobKind::ExternalWorker, "payments", serde_json::json!({}));
        store.insert(&job).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let mut poller = poller(store.clone(), clock, rx);

        tx.send(true).unwrap();
        assert!(poller.is_shutdown());
        assert!(matches!(
            poller.poll(10).await,
            Err(PollerError::Shutdown)
        ));
        // The job is untouched: nothing was claimed after shutdown.
        assert!(store.find_by_id(job.id).await.unwrap().lock_owner.is_none());
    }
}
