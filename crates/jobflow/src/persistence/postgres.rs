//! PostgreSQL implementation of JobStore
//!
//! Production persistence using PostgreSQL with:
//! - Lease claiming via FOR UPDATE SKIP LOCKED
//! - Ownership-checked releases as conditional updates
//! - Atomic dead-letter moves inside a transaction

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::{JobFilter, JobStore, Pagination, StoreError};
use crate::clock::{add_duration, Clock, SystemClock};
use crate::job::{Job, JobKind};

/// PostgreSQL implementation of JobStore
///
/// Uses a connection pool for efficient access. The schema lives in the
/// crate's `migrations/` directory: two tables with the same shape,
/// `jobflow_jobs` (live queue) and `jobflow_deadletter_jobs`.
///
/// # Example
///
/// ```ignore
/// use jobflow::PostgresJobStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresJobStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresJobStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    /// Create a store driven by a caller-supplied clock
    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the crate's schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

const JOB_COLUMNS: &str = "id, kind, handler_type, payload, due_date, retries_remaining, \
     lock_owner, lock_expiration_time, correlation_id, exception_message, exception_detail, \
     scope_id, scope_type, tenant_id, element_id, element_name, create_time";

fn row_to_job(row: &PgRow) -> Result<Job, StoreError> {
    let kind_str: String = row.get("kind");
    let kind: JobKind = kind_str
        .parse()
        .map_err(|e: String| StoreError::Serialization(e))?;

    Ok(Job {
        id: row.get("id"),
        kind,
        handler_type: row.get("handler_type"),
        payload: row.get("payload"),
        due_date: row.get("due_date"),
        retries_remaining: row.get::<i32, _>("retries_remaining") as u32,
        lock_owner: row.get("lock_owner"),
        lock_expiration_time: row.get("lock_expiration_time"),
        correlation_id: row.get("correlation_id"),
        exception_message: row.get("exception_message"),
        exception_detail: row.get("exception_detail"),
        scope_id: row.get("scope_id"),
        scope_type: row.get("scope_type"),
        tenant_id: row.get("tenant_id"),
        element_id: row.get("element_id"),
        element_name: row.get("element_name"),
        create_time: row.get("create_time"),
    })
}

/// Append the WHERE clause for a JobFilter to a query builder
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter, now: DateTime<Utc>) {
    qb.push(" WHERE TRUE");

    if let Some(ref ids) = filter.ids {
        qb.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
    }
    if let Some(kind) = filter.kind {
        qb.push(" AND kind = ").push_bind(kind.as_str());
    }
    if let Some(ref types) = filter.handler_types {
        qb.push(" AND handler_type = ANY(")
            .push_bind(types.clone())
            .push(")");
    }
    if let Some(ref scope) = filter.scope_id {
        qb.push(" AND scope_id = ").push_bind(scope.clone());
    }
    if let Some(ref tenant) = filter.tenant_id {
        qb.push(" AND tenant_id = ").push_bind(tenant.clone());
    }
    if let Some(ref correlation) = filter.correlation_id {
        qb.push(" AND correlation_id = ").push_bind(correlation.clone());
    }
    if filter.executable_now {
        qb.push(" AND retries_remaining > 0")
            .push(" AND (due_date IS NULL OR due_date <= ")
            .push_bind(now)
            .push(")")
            .push(" AND (lock_owner IS NULL OR lock_expiration_time < ")
            .push_bind(now)
            .push(")");
    }
    if filter.with_exception {
        qb.push(" AND exception_message IS NOT NULL");
    }
    if let Some(before) = filter.due_before {
        qb.push(" AND due_date < ").push_bind(before);
    }
    if let Some(after) = filter.due_after {
        qb.push(" AND due_date > ").push_bind(after);
    }
    if let Some(ref owner) = filter.lock_owner {
        qb.push(" AND lock_owner = ").push_bind(owner.clone());
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobflow_jobs (
                id, kind, handler_type, payload, due_date, retries_remaining,
                lock_owner, lock_expiration_time, correlation_id,
                exception_message, exception_detail,
                scope_id, scope_type, tenant_id, element_id, element_name, create_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id)
        .bind(job.kind.as_str())
        .bind(&job.handler_type)
        .bind(&job.payload)
        .bind(job.due_date)
        .bind(job.retries_remaining as i32)
        .bind(&job.lock_owner)
        .bind(job.lock_expiration_time)
        .bind(&job.correlation_id)
        .bind(&job.exception_message)
        .bind(&job.exception_detail)
        .bind(&job.scope_id)
        .bind(&job.scope_type)
        .bind(&job.tenant_id)
        .bind(&job.element_id)
        .bind(&job.element_name)
        .bind(job.create_time)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert job: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(%job.id, kind = %job.kind, "inserted job");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobflow_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::JobNotFound(id))?;

        row_to_job(&row)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobflow_jobs
            SET kind = $2, handler_type = $3, payload = $4, due_date = $5,
                retries_remaining = $6, lock_owner = $7, lock_expiration_time = $8,
                correlation_id = $9, exception_message = $10, exception_detail = $11,
                scope_id = $12, scope_type = $13, tenant_id = $14,
                element_id = $15, element_name = $16
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.kind.as_str())
        .bind(&job.handler_type)
        .bind(&job.payload)
        .bind(job.due_date)
        .bind(job.retries_remaining as i32)
        .bind(&job.lock_owner)
        .bind(job.lock_expiration_time)
        .bind(&job.correlation_id)
        .bind(&job.exception_message)
        .bind(&job.exception_detail)
        .bind(&job.scope_id)
        .bind(&job.scope_type)
        .bind(&job.tenant_id)
        .bind(&job.element_id)
        .bind(&job.element_name)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job.id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid, caller: Option<&str>) -> Result<(), StoreError> {
        let now = self.clock.now();

        let result = sqlx::query(
            r#"
            DELETE FROM jobflow_jobs
            WHERE id = $1
              AND (lock_owner IS NULL OR lock_expiration_time < $2 OR lock_owner = $3)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(caller)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            // Distinguish a missing job from one blocked by a foreign lease.
            let job = self.find_by_id(id).await?;
            return Err(StoreError::OwnershipConflict {
                job_id: id,
                owner: job.lock_owner,
                caller: caller.unwrap_or("<none>").to_string(),
            });
        }

        debug!(%id, "deleted job");
        Ok(())
    }

    #[instrument(skip(self))]
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

        // SKIP LOCKED keeps concurrent acquirers from contending on the
        // same rows; the UPDATE is the per-job atomic lease stamp. The
        // RETURNING list must stay alias-qualified: the CTE in the
        // FROM-list also exposes an `id` column.
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM jobflow_jobs
                WHERE kind = $1
                  AND ($2::text IS NULL OR handler_type = $2)
                  AND retries_remaining > 0
                  AND (due_date IS NULL OR due_date <= $3)
                  AND (lock_owner IS NULL OR lock_expiration_time < $3)
                ORDER BY due_date NULLS FIRST, id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobflow_jobs j
            SET lock_owner = $5,
                lock_expiration_time = $6
            FROM claimable c
            WHERE j.id = c.id
            RETURNING j.id, j.kind, j.handler_type, j.payload, j.due_date,
                j.retries_remaining, j.lock_owner, j.lock_expiration_time,
                j.correlation_id, j.exception_message, j.exception_detail,
                j.scope_id, j.scope_type, j.tenant_id, j.element_id,
                j.element_name, j.create_time
            "#,
        )
        .bind(kind.as_str())
        .bind(topic)
        .bind(now)
        .bind(max_jobs as i64)
        .bind(worker_id)
        .bind(expiry)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to acquire jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            claimed.push(row_to_job(row)?);
        }

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "acquired jobs");
        }
        Ok(claimed)
    }

    #[instrument(skip(self))]
    async fn release(&self, id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobflow_jobs
            SET lock_owner = NULL, lock_expiration_time = NULL
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            let job = self.find_by_id(id).await?;
            return Err(StoreError::OwnershipConflict {
                job_id: id,
                owner: job.lock_owner,
                caller: worker_id.to_string(),
            });
        }

        debug!(%id, worker_id, "released job");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn release_all_for_worker(
        &self,
        worker_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if let Some(tenant) = tenant_id {
            let foreign = sqlx::query(
                r#"
                SELECT tenant_id FROM jobflow_jobs
                WHERE lock_owner = $1 AND tenant_id IS DISTINCT FROM $2
                LIMIT 1
                FOR UPDATE
                "#,
            )
            .bind(worker_id)
            .bind(tenant)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

            if let Some(row) = foreign {
                return Err(StoreError::CrossTenant {
                    worker_id: worker_id.to_string(),
                    expected: tenant.to_string(),
                    actual: row.get("tenant_id"),
                });
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE jobflow_jobs
            SET lock_owner = NULL, lock_expiration_time = NULL
            WHERE lock_owner = $1
            "#,
        )
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(worker_id, count = result.rows_affected(), "released all leases");
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn move_to_dead_letter(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM jobflow_jobs WHERE id = $1
                RETURNING *
            )
            INSERT INTO jobflow_deadletter_jobs (
                id, kind, handler_type, payload, due_date, retries_remaining,
                lock_owner, lock_expiration_time, correlation_id,
                exception_message, exception_detail,
                scope_id, scope_type, tenant_id, element_id, element_name, create_time
            )
            SELECT id, kind, handler_type, payload, due_date, 0,
                   NULL, NULL, correlation_id,
                   exception_message, exception_detail,
                   scope_id, scope_type, tenant_id, element_id, element_name, create_time
            FROM moved
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(id));
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(%id, "moved job to dead-letter queue");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn move_dead_letter_to_executable(
        &self,
        id: Uuid,
        retries: u32,
    ) -> Result<Uuid, StoreError> {
        let new_id = Uuid::now_v7();

        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM jobflow_deadletter_jobs WHERE id = $1
                RETURNING *
            )
            INSERT INTO jobflow_jobs (
                id, kind, handler_type, payload, due_date, retries_remaining,
                lock_owner, lock_expiration_time, correlation_id,
                exception_message, exception_detail,
                scope_id, scope_type, tenant_id, element_id, element_name, create_time
            )
            SELECT $2, kind, handler_type, payload, due_date, $3,
                   NULL, NULL, correlation_id,
                   exception_message, exception_detail,
                   scope_id, scope_type, tenant_id, element_id, element_name, create_time
            FROM moved
            "#,
        )
        .bind(id)
        .bind(new_id)
        .bind(retries as i32)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DeadLetterJobNotFound(id));
        }

        debug!(%id, %new_id, retries, "reinstated dead-letter job");
        Ok(new_id)
    }

    #[instrument(skip(self))]
    async fn find_dead_letter(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobflow_deadletter_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::DeadLetterJobNotFound(id))?;

        row_to_job(&row)
    }

    #[instrument(skip(self, filter, page))]
    async fn list_dead_letter(
        &self,
        filter: &JobFilter,
        page: &Pagination,
    ) -> Result<Vec<Job>, StoreError> {
        let now = self.clock.now();
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "SELECT {JOB_COLUMNS} FROM jobflow_deadletter_jobs"
        ));
        push_filter(&mut qb, filter, now);
        qb.push(" ORDER BY create_time DESC OFFSET ")
            .push_bind(page.offset as i64)
            .push(" LIMIT ")
            .push_bind(page.limit as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self, filter, page))]
    async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: &Pagination,
    ) -> Result<Vec<Job>, StoreError> {
        let now = self.clock.now();
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobflow_jobs"));
        push_filter(&mut qb, filter, now);
        qb.push(" ORDER BY id OFFSET ")
            .push_bind(page.offset as i64)
            .push(" LIMIT ")
            .push_bind(page.limit as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_job).collect()
    }

    #[instrument(skip(self, filter))]
    async fn count_jobs(&self, filter: &JobFilter) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) AS n FROM jobflow_jobs");
        push_filter(&mut qb, filter, now);

        let row = qb
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("n") as u64)
    }
}
