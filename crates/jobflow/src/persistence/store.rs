//! JobStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::job::{Job, JobKind};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found in the live queue
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Job not found in the dead-letter queue
    #[error("dead-letter job not found: {0}")]
    DeadLetterJobNotFound(Uuid),

    /// Lease mutation attempted by a worker that does not own the lease
    ///
    /// This is never silently ignored: an unlock by the wrong owner is a
    /// programming or split-brain error that must surface.
    #[error("job {job_id} is leased by {owner:?}, not by caller {caller}")]
    OwnershipConflict {
        job_id: Uuid,
        owner: Option<String>,
        caller: String,
    },

    /// Bulk operation would straddle tenants
    #[error("worker {worker_id} holds jobs in tenant {actual:?}, expected {expected}")]
    CrossTenant {
        worker_id: String,
        expected: String,
        actual: Option<String>,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Flat filter for the read-only query surface
///
/// All fields are conjunctive; `None` means "don't care".
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub ids: Option<Vec<Uuid>>,
    pub kind: Option<JobKind>,
    pub handler_types: Option<Vec<String>>,
    pub scope_id: Option<String>,
    pub tenant_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Only jobs that would be claimable right now
    pub executable_now: bool,
    /// Only jobs with a recorded exception
    pub with_exception: bool,
    pub due_before: Option<DateTime<Utc>>,
    pub due_after: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
}

impl JobFilter {
    pub fn by_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Default::default()
        }
    }

    pub fn by_kind(kind: JobKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Durable store for jobs
///
/// Two logical partitions share the `Job` record shape: the live queue and
/// the dead-letter queue. The store is the single source of truth for all
/// worker coordination; the only required consistency primitive is a
/// per-job conditional update (the lease stamp and the ownership-checked
/// release). `update` itself is a full replace with last-write-wins
/// semantics; lease ownership, not the store, is what makes concurrent
/// mutation safe.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    // =========================================================================
    // Live queue
    // =========================================================================

    /// Insert a new job into the live queue
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    /// Fetch one job from the live queue
    async fn find_by_id(&self, id: Uuid) -> Result<Job, StoreError>;

    /// Full-replace update of a live job
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Delete a job from the live queue
    ///
    /// Fails with an ownership conflict if the job holds a live lease owned
    /// by someone other than `caller` (or by anyone, when `caller` is
    /// `None`).
    async fn delete(&self, id: Uuid, caller: Option<&str>) -> Result<(), StoreError>;

    // =========================================================================
    // Leasing
    // =========================================================================

    /// Claim up to `max_jobs` eligible jobs of `kind` and stamp them with a
    /// lease for `worker_id`
    ///
    /// Eligible means: due date reached or absent, retries remaining, no
    /// live lease, and (when `topic` is given) a matching handler type.
    /// Each job's stamp is independently atomic; the batch as a whole is
    /// not transactional.
    async fn acquire_jobs(
        &self,
        kind: JobKind,
        topic: Option<&str>,
        max_jobs: usize,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Vec<Job>, StoreError>;

    /// Clear the lease on one job, validating ownership
    async fn release(&self, id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Clear every lease owned by `worker_id`, returning the count
    ///
    /// When `tenant_id` is given and any owned job belongs to a different
    /// tenant, the whole call fails atomically before any mutation.
    async fn release_all_for_worker(
        &self,
        worker_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<u64, StoreError>;

    // =========================================================================
    // Dead-letter queue
    // =========================================================================

    /// Move a live job to the dead-letter partition
    ///
    /// The job arrives there with `retries_remaining = 0` and no lease, and
    /// is excluded from `acquire_jobs` until reinstated.
    async fn move_to_dead_letter(&self, id: Uuid) -> Result<(), StoreError>;

    /// Reinstate a dead-letter job into the live queue with a fresh retry
    /// budget
    ///
    /// The reinstated job gets a new id but keeps its correlation id.
    /// Returns the new id.
    async fn move_dead_letter_to_executable(
        &self,
        id: Uuid,
        retries: u32,
    ) -> Result<Uuid, StoreError>;

    /// Fetch one job from the dead-letter queue
    async fn find_dead_letter(&self, id: Uuid) -> Result<Job, StoreError>;

    /// List dead-letter jobs, newest first
    async fn list_dead_letter(
        &self,
        filter: &JobFilter,
        page: &Pagination,
    ) -> Result<Vec<Job>, StoreError>;

    // =========================================================================
    // Query surface (read-only)
    // =========================================================================

    /// List live jobs matching the filter, ordered by id
    async fn list_jobs(&self, filter: &JobFilter, page: &Pagination)
        -> Result<Vec<Job>, StoreError>;

    /// Count live jobs matching the filter
    async fn count_jobs(&self, filter: &JobFilter) -> Result<u64, StoreError>;
}
