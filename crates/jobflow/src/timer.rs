//! Timer projection
//!
//! Timer jobs are dormant until their due date. The projector sweeps due
//! timers and promotes each one into an immediately-executable
//! async-continuation job carrying the same payload and correlation id.
//! Promotion rides on the lease machinery: acquiring the timer under a
//! lease is what makes each promotion exclusive when several projectors
//! share a store, and the promoted copy gets a fresh id so the two jobs
//! never collide.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::job::{Job, JobKind};
use crate::lease::LeaseManager;
use crate::persistence::{JobStore, StoreError};

/// Configuration for a timer promotion pass
#[derive(Debug, Clone)]
pub struct TimerProjectorConfig {
    /// Identity used for timer leases and the ensuing deletes
    pub projector_id: String,
    /// Maximum timers promoted per pass
    pub batch_size: usize,
    /// Lease held while a timer is being promoted
    pub lease_duration: Duration,
}

impl Default for TimerProjectorConfig {
    fn default() -> Self {
        Self {
            projector_id: format!("timer-projector-{}", Uuid::now_v7()),
            batch_size: 50,
            lease_duration: Duration::from_secs(30),
        }
    }
}

impl TimerProjectorConfig {
    pub fn with_projector_id(mut self, id: impl Into<String>) -> Self {
        self.projector_id = id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }
}

/// Promotes due timer jobs into executable async continuations
pub struct TimerProjector {
    store: Arc<dyn JobStore>,
    leases: LeaseManager,
    config: TimerProjectorConfig,
}

impl TimerProjector {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_config(store, clock, TimerProjectorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: TimerProjectorConfig,
    ) -> Self {
        Self {
            leases: LeaseManager::new(store.clone(), clock),
            store,
            config,
        }
    }

    /// Run one promotion pass; returns how many timers were promoted
    ///
    /// A timer that fails to promote keeps its lease and is retried after
    /// expiry rather than aborting the rest of the batch.
    #[instrument(skip(self), fields(projector_id = %self.config.projector_id))]
    pub async fn promote_due_timers(&self) -> Result<usize, StoreError> {
        let timers = self
            .leases
            .acquire_and_lock(
                JobKind::Timer,
                None,
                self.config.batch_size,
                &self.config.projector_id,
                self.config.lease_duration,
            )
            .await?;

        let mut promoted = 0;
        for timer in &timers {
            match self.promote(timer).await {
                Ok(continuation_id) => {
                    debug!(timer_id = %timer.id, %continuation_id, "promoted timer");
                    promoted += 1;
                }
                Err(e) => {
                    warn!(timer_id = %timer.id, error = %e, "failed to promote timer");
                }
            }
        }
        Ok(promoted)
    }

    /// Insert the continuation first, then delete the timer under the
    /// projector's identity. A crash between the two steps leaves the
    /// timer leased; the retry after lease expiry re-inserts a duplicate
    /// continuation, which downstream handlers absorb via correlation id.
    async fn promote(&self, timer: &Job) -> Result<Uuid, StoreError> {
        let mut continuation = Job::new(
            JobKind::AsyncContinuation,
            timer.handler_type.clone(),
            timer.payload.clone(),
        )
        .with_retries(timer.retries_remaining)
        .with_correlation_id(timer.correlation_id.clone());
        continuation.scope_id = timer.scope_id.clone();
        continuation.scope_type = timer.scope_type.clone();
        continuation.tenant_id = timer.tenant_id.clone();
        continuation.element_id = timer.element_id.clone();
        continuation.element_name = timer.element_name.clone();

        let continuation_id = continuation.id;
        self.store.insert(&continuation).await?;
        self.store
            .delete(timer.id, Some(&self.config.projector_id))
            .await?;
        Ok(continuation_id)
    }
}
