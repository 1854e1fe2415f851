//! Job handler bridging the queue to the history pipeline

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::event::{HistoryEvent, HISTORY_JOB_HANDLER_TYPE};
use super::store::HistoryStore;
use super::transformer::{Applied, HistoryTransformerRegistry};
use crate::engine::{JobHandler, JobHandlerError};
use crate::job::Job;

/// Executes history-event jobs by routing each event to its transformer.
///
/// Failure classification drives the queue's retry behavior:
/// - a malformed payload or unknown event type is fatal (dead letter),
/// - an event whose target entity does not exist yet is retryable, so
///   out-of-order delivery converges once the creating event lands,
/// - a stale event is success: it is discarded and the job completes.
pub struct HistoryJobHandler {
    store: Arc<dyn HistoryStore>,
    registry: Arc<HistoryTransformerRegistry>,
}

impl HistoryJobHandler {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            registry: Arc::new(HistoryTransformerRegistry::with_defaults()),
        }
    }

    pub fn with_registry(
        store: Arc<dyn HistoryStore>,
        registry: Arc<HistoryTransformerRegistry>,
    ) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl JobHandler for HistoryJobHandler {
    fn handler_type(&self) -> &str {
        HISTORY_JOB_HANDLER_TYPE
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn execute(&self, job: &Job) -> Result<(), JobHandlerError> {
        let event = HistoryEvent::from_payload(&job.payload)?;

        let Some(transformer) = self.registry.resolve(event.event_type) else {
            return Err(JobHandlerError::fatal(format!(
                "no history transformer registered: {}",
                event.event_type
            )));
        };

        let applicable = transformer
            .is_applicable(&event, self.store.as_ref())
            .await
            .map_err(|e| JobHandlerError::retryable(e.to_string()))?;
        if !applicable {
            return Err(JobHandlerError::retryable(format!(
                "history event not yet applicable: {} for entity {}",
                event.event_type, event.entity_id
            )));
        }

        match transformer
            .apply(&event, self.store.as_ref())
            .await
            .map_err(|e| JobHandlerError::retryable(e.to_string()))?
        {
            Applied::Applied => Ok(()),
            Applied::Stale => {
                debug!(
                    event_type = %event.event_type,
                    entity_id = %event.entity_id,
                    "discarding stale history event"
                );
                Ok(())
            }
        }
    }
}
