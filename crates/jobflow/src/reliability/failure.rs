//! Failure handling: retry decrement, backoff requeue, and escalation
//!
//! On a retryable handler failure the job's exception context is recorded,
//! the retry counter decremented, the lease cleared, and the due date
//! pushed out by the policy's backoff. Exhaustion (or a fatal failure)
//! moves the job to the dead-letter queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::clock::{add_duration, Clock};
use crate::engine::JobHandlerError;
use crate::persistence::{JobStore, StoreError};

/// Outcome of handling a job failure
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Job re-enters the live queue, eligible after the backoff delay
    WillRetry {
        retries_remaining: u32,
        delay: Duration,
    },

    /// Retry budget exhausted or failure was fatal; job is dead-lettered
    DeadLettered,
}

/// Applies the retry/escalation rules after a handler failure
pub struct RetryHandler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a handler failure for a job leased by `worker_id`
    ///
    /// Fails with an ownership conflict if the caller no longer holds a
    /// live lease on the job (its lease may have expired and been
    /// reclaimed).
    #[instrument(skip(self, error), fields(%job_id, worker_id))]
    pub async fn on_failure(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &JobHandlerError,
    ) -> Result<FailureOutcome, StoreError> {
        let now = self.clock.now();
        let mut job = self.store.find_by_id(job_id).await?;

        if !(job.is_locked(now) && job.lock_owner.as_deref() == Some(worker_id)) {
            return Err(StoreError::OwnershipConflict {
                job_id,
                owner: job.lock_owner.clone(),
                caller: worker_id.to_string(),
            });
        }

        job.exception_message = Some(error.message.clone());
        job.exception_detail = error.detail.clone();

        job.retries_remaining = if error.fatal {
            0
        } else {
            job.retries_remaining.saturating_sub(1)
        };

        if job.retries_remaining == 0 {
            job.clear_lease();
            self.store.update(&job).await?;
            self.store.move_to_dead_letter(job.id).await?;

            warn!(
                %job_id,
                handler_type = %job.handler_type,
                fatal = error.fatal,
                error = %error.message,
                "job escalated to dead-letter queue"
            );
            return Ok(FailureOutcome::DeadLettered);
        }

        let delay = self.policy.delay_for_remaining(job.retries_remaining);
        job.clear_lease();
        job.due_date = Some(add_duration(now, delay));
        self.store.update(&job).await?;

        debug!(
            %job_id,
            retries_remaining = job.retries_remaining,
            delay_ms = delay.as_millis() as u64,
            error = %error.message,
            "job requeued for retry"
        );

        Ok(FailureOutcome::WillRetry {
            retries_remaining: job.retries_remaining,
            delay,
        })
    }

    /// Manual reinstatement of a dead-letter job with a fresh retry budget
    ///
    /// Returns the new job id; the correlation id is unchanged.
    #[instrument(skip(self))]
    pub async fn reinstate(&self, job_id: Uuid, retries: u32) -> Result<Uuid, StoreError> {
        self.store
            .move_dead_letter_to_executable(job_id, retries)
            .await
    }
}
