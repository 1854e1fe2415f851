//! In-memory implementation of JobStore for tests and embedding
//!
//! Holds both partitions behind a single lock so bulk operations (the
//! cross-tenant check, dead-letter moves) are atomic, matching the
//! transactional semantics of the PostgreSQL implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{JobFilter, JobStore, Pagination, StoreError};
use crate::clock::{add_duration, Clock, SystemClock};
use crate::job::{Job, JobKind};

struct Inner {
    live: HashMap<Uuid, Job>,
    dead: HashMap<Uuid, Job>,
}

/// In-memory implementation of JobStore
///
/// # Example
///
/// ```
/// use jobflow::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// ```
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by a caller-supplied clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                live: HashMap::new(),
                dead: HashMap::new(),
            }),
            clock,
        }
    }

    /// Number of jobs in the live queue
    pub fn live_count(&self) -> usize {
        self.inner.read().live.len()
    }

    /// Number of jobs in the dead-letter queue
    pub fn dead_letter_count(&self) -> usize {
        self.inner.read().dead.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.live.clear();
        inner.dead.clear();
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches(job: &Job, filter: &JobFilter, now: chrono::DateTime<chrono::Utc>) -> bool {
    if let Some(ref ids) = filter.ids {
        if !ids.contains(&job.id) {
            return false;
        }
    }
    if let Some(kind) = filter.kind {
        if job.kind != kind {
            return false;
        }
    }
    if let Some(ref types) = filter.handler_types {
        if !types.iter().any(|t| t == &job.handler_type) {
            return false;
        }
    }
    if let Some(ref scope) = filter.scope_id {
        if job.scope_id.as_deref() != Some(scope.as_str()) {
            return false;
        }
    }
    if let Some(ref tenant) = filter.tenant_id {
        if job.tenant_id.as_deref() != Some(tenant.as_str()) {
            return false;
        }
    }
    if let Some(ref correlation) = filter.correlation_id {
        if &job.correlation_id != correlation {
            return false;
        }
    }
    if filter.executable_now && !job.is_eligible(now) {
        return false;
    }
    if filter.with_exception && job.exception_message.is_none() {
        return false;
    }
    if let Some(before) = filter.due_before {
        if !job.due_date.map(|d| d < before).unwrap_or(false) {
            return false;
        }
    }
    if let Some(after) = filter.due_after {
        if !job.due_date.map(|d| d > after).unwrap_or(false) {
            return false;
        }
    }
    if let Some(ref owner) = filter.lock_owner {
        if job.lock_owner.as_deref() != Some(owner.as_str()) {
            return false;
        }
    }
    true
}

fn paginate(mut jobs: Vec<Job>, page: &Pagination) -> Vec<Job> {
    jobs.sort_by_key(|j| j.id);
    jobs.into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.write().live.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Job, StoreError> {
        self.inner
            .read()
            .live
            .get(&id)
            .cloned()
            .ok_or(StoreError::JobNotFound(id))
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if !inner.live.contains_key(&job.id) {
            return Err(StoreError::JobNotFound(job.id));
        }
        inner.live.insert(job.id, job.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid, caller: Option<&str>) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write();
        let job = inner.live.get(&id).ok_or(StoreError::JobNotFound(id))?;

        if job.is_locked(now) && job.lock_owner.as_deref() != caller {
            return Err(StoreError::OwnershipConflict {
                job_id: id,
                owner: job.lock_owner.clone(),
                caller: caller.unwrap_or("<none>").to_string(),
            });
        }

        inner.live.remove(&id);
        Ok(())
    }

    async fn acquire_jobs(
        &self,
        kind: JobKind,
        topic: Option<&str>,
        max_jobs: usize,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let now = self.clock.now();
        let expiry = add_duration(now, lease_duration);
        let mut inner = self.inner.write();

        // Deterministic claim order: earliest due date first, then id.
        let mut candidates: Vec<Uuid> = inner
            .live
            .values()
            .filter(|j| j.kind == kind)
            .filter(|j| topic.map(|t| j.handler_type == t).unwrap_or(true))
            .filter(|j| j.is_eligible(now))
            .map(|j| j.id)
            .collect();
        candidates.sort_by_key(|id| {
            let j = &inner.live[id];
            (j.due_date, j.id)
        });

        let mut claimed = Vec::new();
        for id in candidates.into_iter().take(max_jobs) {
            if let Some(job) = inner.live.get_mut(&id) {
                job.lock_owner = Some(worker_id.to_string());
                job.lock_expiration_time = Some(expiry);
                claimed.push(job.clone());
            }
        }

        Ok(claimed)
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let job = inner.live.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;

        if job.lock_owner.as_deref() != Some(worker_id) {
            return Err(StoreError::OwnershipConflict {
                job_id: id,
                owner: job.lock_owner.clone(),
                caller: worker_id.to_string(),
            });
        }

        job.clear_lease();
        Ok(())
    }

    async fn release_all_for_worker(
        &self,
        worker_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();

        let owned: Vec<Uuid> = inner
            .live
            .values()
            .filter(|j| j.lock_owner.as_deref() == Some(worker_id))
            .map(|j| j.id)
            .collect();

        // Tenant check before any mutation: the whole call is atomic.
        if let Some(tenant) = tenant_id {
            for id in &owned {
                let job = &inner.live[id];
                if job.tenant_id.as_deref() != Some(tenant) {
                    return Err(StoreError::CrossTenant {
                        worker_id: worker_id.to_string(),
                        expected: tenant.to_string(),
                        actual: job.tenant_id.clone(),
                    });
                }
            }
        }

        for id in &owned {
            if let Some(job) = inner.live.get_mut(id) {
                job.clear_lease();
            }
        }

        Ok(owned.len() as u64)
    }

    async fn move_to_dead_letter(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let mut job = inner.live.remove(&id).ok_or(StoreError::JobNotFound(id))?;

        job.retries_remaining = 0;
        job.clear_lease();
        inner.dead.insert(job.id, job);
        Ok(())
    }

    async fn move_dead_letter_to_executable(
        &self,
        id: Uuid,
        retries: u32,
    ) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.write();
        let mut job = inner
            .dead
            .remove(&id)
            .ok_or(StoreError::DeadLetterJobNotFound(id))?;

        // Fresh id, same correlation id.
        job.id = Uuid::now_v7();
        job.retries_remaining = retries;
        job.clear_lease();

        let new_id = job.id;
        inner.live.insert(new_id, job);
        Ok(new_id)
    }

    async fn find_dead_letter(&self, id: Uuid) -> Result<Job, StoreError> {
        self.inner
            .read()
            .dead
            .get(&id)
            .cloned()
            .ok_or(StoreError::DeadLetterJobNotFound(id))
    }

    async fn list_dead_letter(
        &self,
        filter: &JobFilter,
        page: &Pagination,
    ) -> Result<Vec<Job>, StoreError> {
        let now = self.clock.now();
        let jobs: Vec<Job> = self
            .inner
            .read()
            .dead
            .values()
            .filter(|j| matches(j, filter, now))
            .cloned()
            .collect();
        Ok(paginate(jobs, page))
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: &Pagination,
    ) -> Result<Vec<Job>, StoreError> {
        let now = self.clock.now();
        let jobs: Vec<Job> = self
            .inner
            .read()
            .live
            .values()
            .filter(|j| matches(j, filter, now))
            .cloned()
            .collect();
        Ok(paginate(jobs, page))
    }

    async fn count_jobs(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let now = self.clock.now();
        Ok(self
            .inner
            .read()
            .live
            .values()
            .filter(|j| matches(j, filter, now))
            .count() as u64)
    }
}
