//! In-memory implementation of HistoryStore for tests and embedding

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::entity::{
    may_apply, HistoricActivityInstance, HistoricCaseInstance, HistoricEntityLink,
    HistoricTaskInstance, HistoricVariable,
};
use super::store::HistoryStore;
use crate::persistence::StoreError;

#[derive(Default)]
struct Inner {
    case_instances: HashMap<String, HistoricCaseInstance>,
    tasks: HashMap<String, HistoricTaskInstance>,
    activities: HashMap<String, HistoricActivityInstance>,
    variables: HashMap<String, HistoricVariable>,
    links: HashMap<String, HistoricEntityLink>,
}

/// In-memory implementation of HistoryStore
///
/// A single lock over all families makes the per-entity compare-and-set
/// and the cascade delete atomic, matching the transactional semantics of
/// the PostgreSQL implementation.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn case_instance_count(&self) -> usize {
        self.inner.read().case_instances.len()
    }

    pub fn task_count(&self) -> usize {
        self.inner.read().tasks.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        *inner = Inner::default();
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn get_case_instance(
        &self,
        id: &str,
    ) -> Result<Option<HistoricCaseInstance>, StoreError> {
        Ok(self.inner.read().case_instances.get(id).cloned())
    }

    async fn insert_case_instance(
        &self,
        entity: &HistoricCaseInstance,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .case_instances
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn update_case_instance(
        &self,
        entity: &HistoricCaseInstance,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(stored) = inner.case_instances.get_mut(&entity.id) else {
            return Ok(false);
        };
        let event_time = entity
            .last_updated_time
            .ok_or_else(|| StoreError::Serialization("update without timestamp".into()))?;
        if !may_apply(event_time, stored.last_updated_time) {
            return Ok(false);
        }
        *stored = entity.clone();
        Ok(true)
    }

    async fn delete_case_instance_cascade(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.case_instances.remove(id);
        inner
            .tasks
            .retain(|_, t| t.case_instance_id.as_deref() != Some(id));
        inner
            .activities
            .retain(|_, a| a.case_instance_id.as_deref() != Some(id));
        inner
            .variables
            .retain(|_, v| v.case_instance_id.as_deref() != Some(id));
        inner
            .links
            .retain(|_, l| l.case_instance_id.as_deref() != Some(id));
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<HistoricTaskInstance>, StoreError> {
        Ok(self.inner.read().tasks.get(id).cloned())
    }

    async fn insert_task(&self, entity: &HistoricTaskInstance) -> Result<(), StoreError> {
        self.inner
            .write()
            .tasks
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn update_task(&self, entity: &HistoricTaskInstance) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(stored) = inner.tasks.get_mut(&entity.id) else {
            return Ok(false);
        };
        let event_time = entity
            .last_updated_time
            .ok_or_else(|| StoreError::Serialization("update without timestamp".into()))?;
        if !may_apply(event_time, stored.last_updated_time) {
            return Ok(false);
        }
        *stored = entity.clone();
        Ok(true)
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        self.inner.write().tasks.remove(id);
        Ok(())
    }

    async fn get_activity(
        &self,
        id: &str,
    ) -> Result<Option<HistoricActivityInstance>, StoreError> {
        Ok(self.inner.read().activities.get(id).cloned())
    }

    async fn insert_activity(
        &self,
        entity: &HistoricActivityInstance,
    ) -> Result<(), StoreError> {
        self.inner
            .write()
            .activities
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn update_activity(
        &self,
        entity: &HistoricActivityInstance,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(stored) = inner.activities.get_mut(&entity.id) else {
            return Ok(false);
        };
        let event_time = entity
            .last_updated_time
            .ok_or_else(|| StoreError::Serialization("update without timestamp".into()))?;
        if !may_apply(event_time, stored.last_updated_time) {
            return Ok(false);
        }
        *stored = entity.clone();
        Ok(true)
    }

    async fn get_variable(&self, id: &str) -> Result<Option<HistoricVariable>, StoreError> {
        Ok(self.inner.read().variables.get(id).cloned())
    }

    async fn insert_variable(&self, entity: &HistoricVariable) -> Result<(), StoreError> {
        self.inner
            .write()
            .variables
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn update_variable(&self, entity: &HistoricVariable) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let Some(stored) = inner.variables.get_mut(&entity.id) else {
            return Ok(false);
        };
        let event_time = entity
            .last_updated_time
            .ok_or_else(|| StoreError::Serialization("update without timestamp".into()))?;
        if !may_apply(event_time, stored.last_updated_time) {
            return Ok(false);
        }
        *stored = entity.clone();
        Ok(true)
    }

    async fn delete_variable(&self, id: &str) -> Result<(), StoreError> {
        self.inner.write().variables.remove(id);
        Ok(())
    }

    async fn get_link(&self, id: &str) -> Result<Option<HistoricEntityLink>, StoreError> {
        Ok(self.inner.read().links.get(id).cloned())
    }

    async fn insert_link(&self, entity: &HistoricEntityLink) -> Result<(), StoreError> {
        self.inner
            .write()
            .links
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn delete_link(&self, id: &str) -> Result<(), StoreError> {
        self.inner.write().links.remove(id);
        Ok(())
    }
}
