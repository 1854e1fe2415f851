//! History transformer trait and registry
//!
//! A transformer knows how to apply one event type to the read-model. The
//! registry is an explicit map built at startup: the set of event types is
//! finite and known at compile time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::event::{HistoryEvent, HistoryEventType};
use super::store::HistoryStore;
use crate::persistence::StoreError;

/// Result of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The read-model was mutated (or the mutation was an exact replay)
    Applied,

    /// The event carried a strictly older timestamp than the stored state
    /// and was discarded; not an error
    Stale,
}

/// Applies one event type to the historic read-model
#[async_trait]
pub trait HistoryTransformer: Send + Sync + 'static {
    /// The event type this transformer handles
    fn event_type(&self) -> HistoryEventType;

    /// Whether the event can be applied right now
    ///
    /// Typically: does the referenced entity exist, or does this event
    /// type not require it to pre-exist? A not-yet-applicable event is
    /// requeued by the pipeline and retried once its prerequisite arrives.
    async fn is_applicable(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<bool, StoreError>;

    /// Apply the event
    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError>;
}

/// Registry of transformers, keyed by event type
pub struct HistoryTransformerRegistry {
    transformers: HashMap<HistoryEventType, Arc<dyn HistoryTransformer>>,
}

impl HistoryTransformerRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            transformers: HashMap::new(),
        }
    }

    /// A registry with every built-in transformer registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for transformer in super::transformers::default_transformers() {
            registry.register(transformer);
        }
        registry
    }

    pub fn register(&mut self, transformer: Arc<dyn HistoryTransformer>) {
        self.transformers
            .insert(transformer.event_type(), transformer);
    }

    pub fn resolve(&self, event_type: HistoryEventType) -> Option<Arc<dyn HistoryTransformer>> {
        self.transformers.get(&event_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}

impl Default for HistoryTransformerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for HistoryTransformerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryTransformerRegistry")
            .field(
                "event_types",
                &self.transformers.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_every_event_type() {
        let registry = HistoryTransformerRegistry::with_defaults();

        for event_type in [
            HistoryEventType::CaseInstanceStart,
            HistoryEventType::CaseInstanceUpdate,
            HistoryEventType::CaseInstanceEnd,
            HistoryEventType::CaseInstanceDelete,
            HistoryEventType::TaskCreate,
            HistoryEventType::TaskUpdate,
            HistoryEventType::TaskDelete,
            HistoryEventType::ActivityStart,
            HistoryEventType::ActivityEnd,
            HistoryEventType::VariableSet,
            HistoryEventType::VariableDelete,
            HistoryEventType::EntityLinkCreate,
            HistoryEventType::EntityLinkDelete,
        ] {
            assert!(
                registry.resolve(event_type).is_some(),
                "missing transformer for {event_type}"
            );
        }
    }
}
