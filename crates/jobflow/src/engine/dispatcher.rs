//! The execution dispatcher
//!
//! Single synchronous entry point for a leased job: resolve the handler,
//! invoke it, and route the outcome back into deletion, retry, or
//! escalation. A handler failure never propagates past the dispatch call;
//! the worker loop only sees the outcome.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::job::Job;
use crate::lease::LeaseManager;
use crate::persistence::{JobStore, StoreError};
use crate::reliability::{FailureOutcome, RetryHandler};

use super::registry::{HandlerRegistry, JobHandlerError};

/// How a dispatched job was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handler succeeded; the job was deleted
    Completed,

    /// Retryable failure; the job re-entered the live queue
    Retried { retries_remaining: u32 },

    /// Fatal failure or exhausted budget; the job was dead-lettered
    DeadLettered,
}

/// Errors from the dispatch path itself (not handler failures)
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Executes leased jobs and routes their outcomes
///
/// All collaborators are constructor-injected; the dispatcher holds no
/// ambient state.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    retry: Arc<RetryHandler>,
    leases: LeaseManager,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        retry: Arc<RetryHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let leases = LeaseManager::new(store.clone(), clock);
        Self {
            store,
            registry,
            retry,
            leases,
        }
    }

    /// Execute one leased job on behalf of `worker_id`
    ///
    /// The caller must hold a live lease on the job; a stale or foreign
    /// lease surfaces as an ownership conflict before the handler runs.
    #[instrument(skip(self, job), fields(job_id = %job.id, handler_type = %job.handler_type))]
    pub async fn execute(&self, job: &Job, worker_id: &str) -> Result<DispatchOutcome, DispatchError> {
        self.leases.assert_owner(job, worker_id)?;

        // An unregistered handler type can never succeed on retry.
        let Some(handler) = self.registry.resolve(&job.handler_type) else {
            warn!(handler_type = %job.handler_type, "no handler registered");
            let error =
                JobHandlerError::fatal(format!("no handler registered: {}", job.handler_type));
            self.retry.on_failure(job.id, worker_id, &error).await?;
            return Ok(DispatchOutcome::DeadLettered);
        };

        match handler.execute(job).await {
            Ok(()) => {
                self.store.delete(job.id, Some(worker_id)).await?;
                debug!("job completed");
                Ok(DispatchOutcome::Completed)
            }
            Err(error) => {
                let outcome = self.retry.on_failure(job.id, worker_id, &error).await?;
                Ok(match outcome {
                    FailureOutcome::WillRetry {
                        retries_remaining, ..
                    } => DispatchOutcome::Retried { retries_remaining },
                    FailureOutcome::DeadLettered => DispatchOutcome::DeadLettered,
                })
            }
        }
    }
}
