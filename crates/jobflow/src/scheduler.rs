//! Scheduling and administrative operations
//!
//! [`JobScheduler`] is the producer-facing entry point: build a
//! [`ScheduleRequest`], get back the id of a persisted job. [`JobAdmin`]
//! is the operator surface over the same store: force-unlock, adjust
//! retry budgets, and move jobs across the dead-letter boundary.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::job::{Job, JobKind};
use crate::persistence::{JobFilter, JobStore, Pagination, StoreError};

/// A request to enqueue one background job
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub kind: JobKind,
    pub handler_type: String,
    pub payload: serde_json::Value,
    pub due_date: Option<DateTime<Utc>>,
    pub retries: u32,
    pub correlation_id: Option<String>,
    pub scope_id: Option<String>,
    pub scope_type: Option<String>,
    pub tenant_id: Option<String>,
    pub element_id: Option<String>,
    pub element_name: Option<String>,
}

impl ScheduleRequest {
    pub fn new(
        kind: JobKind,
        handler_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            handler_type: handler_type.into(),
            payload,
            due_date: None,
            retries: Job::DEFAULT_RETRIES,
            correlation_id: None,
            scope_id: None,
            scope_type: None,
            tenant_id: None,
            element_id: None,
            element_name: None,
        }
    }

    /// Defer execution until the given instant
    pub fn with_due_date(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Group this job with related work under one correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_scope(
        mut self,
        scope_id: impl Into<String>,
        scope_type: impl Into<String>,
    ) -> Self {
        self.scope_id = Some(scope_id.into());
        self.scope_type = Some(scope_type.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_element(
        mut self,
        element_id: impl Into<String>,
        element_name: impl Into<String>,
    ) -> Self {
        self.element_id = Some(element_id.into());
        self.element_name = Some(element_name.into());
        self
    }

    fn into_job(self) -> Job {
        let mut job = Job::new(self.kind, self.handler_type, self.payload).with_retries(self.retries);
        job.due_date = self.due_date;
        if let Some(correlation_id) = self.correlation_id {
            job.correlation_id = correlation_id;
        }
        job.scope_id = self.scope_id;
        job.scope_type = self.scope_type;
        job.tenant_id = self.tenant_id;
        job.element_id = self.element_id;
        job.element_name = self.element_name;
        job
    }
}

/// Producer-facing entry point for enqueuing jobs
#[derive(Clone)]
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Persist one job; returns its id
    #[instrument(skip(self, request), fields(kind = %request.kind, handler_type = %request.handler_type))]
    pub async fn schedule(&self, request: ScheduleRequest) -> Result<Uuid, StoreError> {
        let job = request.into_job();
        let id = job.id;
        self.store.insert(&job).await?;
        info!(job_id = %id, "Scheduled job");
        Ok(id)
    }
}

/// Operator surface over the job store
#[derive(Clone)]
pub struct JobAdmin {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl JobAdmin {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Release one job's lease on behalf of its owner
    ///
    /// Fails with an ownership conflict if `worker_id` does not hold
    /// the lease.
    pub async fn unacquire(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        self.store.release(job_id, worker_id).await
    }

    /// Forcibly clear a job's lease, regardless of owner
    ///
    /// For cleanup after a known-dead worker. The lease becomes free
    /// immediately instead of at expiry.
    #[instrument(skip(self))]
    pub async fn force_unacquire(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut job = self.store.find_by_id(job_id).await?;
        job.clear_lease();
        self.store.update(&job).await?;
        info!(%job_id, "Force-released lease");
        Ok(())
    }

    /// Release every lease held by one worker identity
    pub async fn unacquire_all(
        &self,
        worker_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        self.store.release_all_for_worker(worker_id, tenant_id).await
    }

    /// Overwrite a job's remaining retry budget
    ///
    /// Setting a positive budget on an exhausted job makes it eligible
    /// again without touching its exception record.
    #[instrument(skip(self))]
    pub async fn set_retries(&self, job_id: Uuid, retries: u32) -> Result<(), StoreError> {
        let mut job = self.store.find_by_id(job_id).await?;
        job.retries_remaining = retries;
        self.store.update(&job).await
    }

    /// Move a live job straight to the dead-letter queue
    pub async fn move_to_dead_letter(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.store.move_to_dead_letter(job_id).await
    }

    /// Reinstate a dead-letter job as a fresh executable job
    ///
    /// Returns the new job's id; the correlation id is preserved.
    #[instrument(skip(self))]
    pub async fn move_dead_letter_to_executable(
        &self,
        job_id: Uuid,
        retries: u32,
    ) -> Result<Uuid, StoreError> {
        let new_id = self
            .store
            .move_dead_letter_to_executable(job_id, retries)
            .await?;
        info!(%job_id, %new_id, "Reinstated dead-letter job");
        Ok(new_id)
    }

    /// Delete a live job; fails if another worker holds a live lease
    pub async fn delete(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.store.delete(job_id, None).await
    }

    pub async fn find(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.store.find_by_id(job_id).await
    }

    pub async fn find_dead_letter(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.store.find_dead_letter(job_id).await
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: &Pagination,
    ) -> Result<Vec<Job>, StoreError> {
        self.store.list_jobs(filter, page).await
    }

    pub async fn count_jobs(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        self.store.count_jobs(filter).await
    }

    pub async fn list_dead_letter(
        &self,
        filter: &JobFilter,
        page: &Pagination,
    ) -> Result<Vec<Job>, StoreError> {
        self.store.list_dead_letter(filter, page).await
    }

    /// Current time as seen by the engine's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::InMemoryJobStore;
    use chrono::TimeDelta;
    use std::time::Duration;

    #[tokio::test]
    async fn test_schedule_persists_all_fields() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let scheduler = JobScheduler::new(store.clone());

        let due = clock.now() + TimeDelta::minutes(5);
        let id = scheduler
            .schedule(
                ScheduleRequest::new(
                    JobKind::Timer,
                    "escalate",
                    serde_json::json!({"case": "c1"}),
                )
                .with_due_date(due)
                .with_retries(5)
                .with_correlation_id("corr-1")
                .with_scope("c1", "case_instance")
                .with_tenant("acme")
                .with_element("el-1", "Escalation timer"),
            )
            .await
            .unwrap();

        let job = store.find_by_id(id).await.unwrap();
        assert_eq!(job.kind, JobKind::Timer);
        assert_eq!(job.due_date, Some(due));
        assert_eq!(job.retries_remaining, 5);
        assert_eq!(job.correlation_id, "corr-1");
        assert_eq!(job.scope_id.as_deref(), Some("c1"));
        assert_eq!(job.tenant_id.as_deref(), Some("acme"));
        assert_eq!(job.element_name.as_deref(), Some("Escalation timer"));
        assert!(job.lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_admin_unacquire_is_owner_checked() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let admin = JobAdmin::new(store.clone(), clock);

        let job = Job::new(JobKind::ExternalWorker, "payments", serde_json::json!({}));
        store.insert(&job).await.unwrap();
        store
            .acquire_jobs(
                JobKind::ExternalWorker,
                None,
                1,
                "dead-worker",
                Duration::from_secs(300),
            )
            .await
            .unwrap();

        // A non-owner bounces off the ownership guard.
        let err = admin.unacquire(job.id, "someone-else").await.unwrap_err();
        assert!(matches!(err, StoreError::OwnershipConflict { .. }));

        // The owner releases cleanly, and force-release works regardless.
        admin.unacquire(job.id, "dead-worker").await.unwrap();
        let freed = store.find_by_id(job.id).await.unwrap();
        assert!(freed.lock_owner.is_none());
        assert!(freed.lock_expiration_time.is_none());

        store
            .acquire_jobs(
                JobKind::ExternalWorker,
                None,
                1,
                "dead-worker",
                Duration::from_secs(300),
            )
            .await
            .unwrap();
        admin.force_unacquire(job.id).await.unwrap();
        assert!(store.find_by_id(job.id).await.unwrap().lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_admin_set_retries_revives_exhausted_job() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let admin = JobAdmin::new(store.clone(), clock.clone());

        let job = Job::new(JobKind::ExternalWorker, "payments", serde_json::json!({}))
            .with_retries(0);
        store.insert(&job).await.unwrap();
        assert!(!store.find_by_id(job.id).await.unwrap().is_eligible(clock.now()));

        admin.set_retries(job.id, 3).await.unwrap();
        assert!(store.find_by_id(job.id).await.unwrap().is_eligible(clock.now()));
    }

    #[tokio::test]
    async fn test_admin_dead_letter_round_trip() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()));
        let admin = JobAdmin::new(store.clone(), clock);

        let job = Job::new(JobKind::Message, "order-events", serde_json::json!({}))
            .with_correlation_id("corr-7");
        store.insert(&job).await.unwrap();

        admin.move_to_dead_letter(job.id).await.unwrap();
        assert!(store.find_by_id(job.id).await.is_err());
        assert!(admin.find_dead_letter(job.id).await.is_ok());

        let new_id = admin
            .move_dead_letter_to_executable(job.id, 3)
            .await
            .unwrap();
        assert_ne!(new_id, job.id);
        let revived = store.find_by_id(new_id).await.unwrap();
        assert_eq!(revived.correlation_id, "corr-7");
        assert_eq!(revived.retries_remaining, 3);
    }
}
