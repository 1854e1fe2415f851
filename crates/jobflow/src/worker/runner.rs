//! Worker loop: poll, dispatch, shut down cleanly

use std::sync::Arc;

use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{JobPoller, PollerConfig, PollerError};
use crate::clock::Clock;
use crate::engine::Dispatcher;
use crate::job::JobKind;
use crate::persistence::{JobStore, StoreError};

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Job kind this worker drains
    pub kind: JobKind,

    /// Optional handler-type restriction within the kind
    pub topic: Option<String>,

    /// Tenant this worker is pinned to, if any
    pub tenant_id: Option<String>,

    /// Maximum concurrent job executions
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl JobWorkerConfig {
    /// Create a configuration for draining one job kind
    pub fn new(kind: JobKind) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            kind,
            topic: None,
            tenant_id: None,
            max_concurrency: 10,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Restrict claiming to one handler type
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Pin the worker to a tenant
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Worker is running and claiming jobs
    Running,
    /// Worker is draining (finishing in-flight jobs, not claiming)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Long-running worker that drains one job kind
///
/// # Example
///
/// ```ignore
/// use jobflow::{JobWorker, JobWorkerConfig, JobKind};
///
/// let config = JobWorkerConfig::new(JobKind::ExternalWorker)
///     .with_topic("payments")
///     .with_max_concurrency(10);
///
/// let worker = JobWorker::new(store, dispatcher, clock, config);
/// worker.start()?;
///
/// // ... later
/// worker.shutdown().await?;
/// ```
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    config: JobWorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerStatus>,
    active_jobs: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        config: JobWorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            dispatcher,
            clock,
            active_jobs: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerStatus::Stopped),
            poll_handle: Mutex::new(None),
        }
    }

    /// Start the poll loop
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status == WorkerStatus::Running {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            kind = %self.config.kind,
            topic = ?self.config.topic,
            max_concurrency = self.config.max_concurrency,
            "Starting worker"
        );

        let store = Arc::clone(&self.store);
        let dispatcher = Arc::clone(&self.dispatcher);
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();
        let active_jobs = Arc::clone(&self.active_jobs);
        let shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut poller = JobPoller::new(
                store,
                clock,
                config.worker_id.clone(),
                config.kind,
                config.topic.clone(),
                config.poller.clone(),
                shutdown_rx,
            );

            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let available_slots = active_jobs.available_permits();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(jobs) => {
                        for job in jobs {
                            let permit = match active_jobs.clone().try_acquire_owned() {
                                Ok(p) => p,
                                Err(_) => {
                                    debug!("No permits available");
                                    break;
                                }
                            };

                            let dispatcher = Arc::clone(&dispatcher);
                            let worker_id = config.worker_id.clone();

                            // One job failing never takes down the loop;
                            // dispatch routes failures to retry/dead-letter.
                            tokio::spawn(async move {
                                let job_id = job.id;
                                match dispatcher.execute(&job, &worker_id).await {
                                    Ok(outcome) => {
                                        debug!(%job_id, ?outcome, "Job dispatched");
                                    }
                                    Err(e) => {
                                        error!(%job_id, "Dispatch failed: {}", e);
                                    }
                                }
                                drop(permit);
                            });
                        }
                    }
                    Err(PollerError::Shutdown) => {
                        debug!("Poll loop: shutdown signaled");
                        break;
                    }
                    Err(e) => {
                        error!("Poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
        Ok(())
    }

    /// Shut down gracefully
    ///
    /// Stops claiming, waits out in-flight jobs up to the configured
    /// timeout, then releases every lease still held under this worker's
    /// identity so other workers can claim immediately instead of
    /// waiting for expiry.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        {
            let status = *self.status.read();
            if status == WorkerStatus::Stopped {
                return Ok(());
            }
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");

        *self.status.write() = WorkerStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_jobs.available_permits();
            if available == self.config.max_concurrency {
                debug!("All jobs completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_jobs = self.config.max_concurrency - available,
                    "Shutdown timeout reached"
                );
                return Err(WorkerError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let released = self
            .store
            .release_all_for_worker(&self.config.worker_id, self.config.tenant_id.as_deref())
            .await?;
        if released > 0 {
            info!(released, "Released remaining leases");
        }

        *self.status.write() = WorkerStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }
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
    use crate::clock::SystemClock;
    use crate::engine::{HandlerRegistry, JobHandler, JobHandlerError};
    use crate::job::Job;
    use crate::persistence::InMemoryJobStore;
    use crate::reliability::{RetryHandler, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        executed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn handler_type(&self) -> &str {
            "counter"
        }

        async fn execute(&self, _job: &Job) -> Result<(), JobHandlerError> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn worker(
        store: Arc<InMemoryJobStore>,
        executed: Arc<AtomicUsize>,
        config: JobWorkerConfig,
    ) -> JobWorker {
        let clock = Arc::new(SystemClock);
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(CountingHandler { executed }));
        let retry = Arc::new(RetryHandler::new(
            store.clone(),
            clock.clone(),
            RetryPolicy::immediate(3),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(registry),
            retry,
            clock.clone(),
        ));
        JobWorker::new(store, dispatcher, clock, config)
    }

    #[test]
    fn test_config_builder() {
        let config = JobWorkerConfig::new(JobKind::ExternalWorker)
            .with_worker_id("w1")
            .with_topic("payments")
            .with_tenant("acme")
            .with_max_concurrency(4)
            .with_shutdown_timeout(Duration::from_secs(5));

        assert_eq!(config.worker_id, "w1");
        assert_eq!(config.kind, JobKind::ExternalWorker);
        assert_eq!(config.topic.as_deref(), Some("payments"));
        assert_eq!(config.tenant_id.as_deref(), Some("acme"));
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_stops() {
        let store = Arc::new(InMemoryJobStore::new());
        for _ in 0..5 {
            let job = Job::new(JobKind::ExternalWorker, "counter", serde_json::json!({}));
            store.insert(&job).await.unwrap();
        }

        let executed = Arc::new(AtomicUsize::new(0));
        let config = JobWorkerConfig::new(JobKind::ExternalWorker)
            .with_worker_id("w1")
            .with_poller(PollerConfig::default().with_min_interval(Duration::from_millis(10)));
        let worker = worker(store.clone(), executed.clone(), config);

        worker.start().unwrap();
        assert_eq!(worker.status(), WorkerStatus::Running);
        assert!(worker.start().is_err());

        // Wait until the queue drains.
        for _ in 0..100 {
            if executed.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(executed.load(Ordering::SeqCst), 5);
        assert_eq!(store.live_count(), 0);

        worker.shutdown().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_releases_held_leases() {
        let store = Arc::new(InMemoryJobStore::new());
        let executed = Arc::new(AtomicUsize::new(0));
        let config = JobWorkerConfig::new(JobKind::ExternalWorker).with_worker_id("w1");
        let worker = worker(store.clone(), executed, config);

        // Simulate a lease left behind by a crash of a dispatch path.
        let job = Job::new(JobKind::ExternalWorker, "other", serde_json::json!({}));
        store.insert(&job).await.unwrap();
        store
            .acquire_jobs(
                JobKind::ExternalWorker,
                Some("other"),
                1,
                "w1",
                Duration::from_secs(300),
            )
            .await
            .unwrap();

        worker.start().unwrap();
        worker.shutdown().await.unwrap();

        let released = store.find_by_id(job.id).await.unwrap();
        assert!(released.lock_owner.is_none());
    }
}
