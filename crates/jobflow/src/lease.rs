//! Lease management: acquire, release, and ownership validation
//!
//! All coordination between competing workers is expressed as lease state
//! persisted in the job store; the manager itself holds no locks across
//! calls.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::job::{Job, JobKind};
use crate::persistence::{JobStore, StoreError};

/// Acquires and releases time-bounded exclusive claims on jobs
///
/// Lease expiry is the system's only cancellation mechanism: a worker that
/// crashes or hangs past its lease expiry automatically makes its jobs
/// reclaimable by any other worker.
pub struct LeaseManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Claim up to `max_jobs` eligible jobs and stamp them with a lease
    ///
    /// The returned batch is not transactionally atomic as a whole; each
    /// job's lease stamp is independent.
    #[instrument(skip(self), fields(worker_id))]
    pub async fn acquire_and_lock(
        &self,
        kind: JobKind,
        topic: Option<&str>,
        max_jobs: usize,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self
            .store
            .acquire_jobs(kind, topic, max_jobs, worker_id, lease_duration)
            .await?;

        if !jobs.is_empty() {
            debug!(worker_id, count = jobs.len(), %kind, "acquired jobs");
        }
        Ok(jobs)
    }

    /// Voluntarily unlock one job
    ///
    /// Fails with an ownership conflict if `worker_id` does not hold the
    /// lease; this is never a silent no-op.
    #[instrument(skip(self))]
    pub async fn release(&self, id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        self.store.release(id, worker_id).await
    }

    /// Bulk-unlock every job owned by `worker_id`
    ///
    /// With `tenant_id` given, the whole call fails atomically if the
    /// worker's jobs straddle tenants.
    #[instrument(skip(self))]
    pub async fn release_all_for_worker(
        &self,
        worker_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        self.store.release_all_for_worker(worker_id, tenant_id).await
    }

    /// Ownership-validated mutation guard
    ///
    /// Callers about to complete or fail a job must hold a live lease on
    /// it; an expired lease means another worker may already have
    /// reclaimed the job.
    pub fn assert_owner(&self, job: &Job, worker_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        if job.is_locked(now) && job.lock_owner.as_deref() == Some(worker_id) {
            return Ok(());
        }
        Err(StoreError::OwnershipConflict {
            job_id: job.id,
            owner: job.lock_owner.clone(),
            caller: worker_id.to_string(),
        })
    }
}
