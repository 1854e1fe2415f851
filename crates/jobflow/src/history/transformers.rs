//! Built-in transformers for every history event type
//!
//! Creation-type transformers upsert: the first sighting of an identity
//! inserts, a redelivery or late arrival merges under the timestamp rule.
//! Mutation-type transformers require the entity to pre-exist
//! (`is_applicable`); the pipeline requeues the event until it does.
//! Deletions are guarded by the same timestamp rule and are idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::entity::{
    may_apply, HistoricActivityInstance, HistoricCaseInstance, HistoricEntityLink,
    HistoricTaskInstance, HistoricVariable,
};
use super::event::{
    ActivityFields, CaseInstanceFields, EntityLinkFields, HistoryEvent, HistoryEventType,
    TaskFields, VariableFields,
};
use super::store::HistoryStore;
use super::transformer::{Applied, HistoryTransformer};
use crate::persistence::StoreError;

/// Every built-in transformer, for registry construction
pub(super) fn default_transformers() -> Vec<Arc<dyn HistoryTransformer>> {
    vec![
        Arc::new(CaseInstanceStartTransformer),
        Arc::new(CaseInstanceUpdateTransformer),
        Arc::new(CaseInstanceEndTransformer),
        Arc::new(CaseInstanceDeleteTransformer),
        Arc::new(TaskCreateTransformer),
        Arc::new(TaskUpdateTransformer),
        Arc::new(TaskDeleteTransformer),
        Arc::new(ActivityStartTransformer),
        Arc::new(ActivityEndTransformer),
        Arc::new(VariableSetTransformer),
        Arc::new(VariableDeleteTransformer),
        Arc::new(EntityLinkCreateTransformer),
        Arc::new(EntityLinkDeleteTransformer),
    ]
}

fn typed_fields<T: DeserializeOwned>(event: &HistoryEvent) -> Result<T, StoreError> {
    serde_json::from_value(event.fields.clone())
        .map_err(|e| StoreError::Serialization(format!("history event fields: {e}")))
}

fn merge_case(
    existing: Option<HistoricCaseInstance>,
    event: &HistoryEvent,
    f: &CaseInstanceFields,
) -> HistoricCaseInstance {
    let mut entity = existing.unwrap_or_else(|| HistoricCaseInstance::new(&event.entity_id));
    if f.name.is_some() {
        entity.name = f.name.clone();
    }
    if f.business_key.is_some() {
        entity.business_key = f.business_key.clone();
    }
    if f.state.is_some() {
        entity.state = f.state.clone();
    }
    if f.start_time.is_some() {
        entity.start_time = f.start_time;
    }
    if f.end_time.is_some() {
        entity.end_time = f.end_time;
    }
    if f.tenant_id.is_some() {
        entity.tenant_id = f.tenant_id.clone();
    }
    entity.last_updated_time = Some(event.last_update_time);
    entity
}

fn merge_task(
    existing: Option<HistoricTaskInstance>,
    event: &HistoryEvent,
    f: &TaskFields,
) -> HistoricTaskInstance {
    let mut entity = existing.unwrap_or_else(|| HistoricTaskInstance::new(&event.entity_id));
    if event.case_instance_id.is_some() {
        entity.case_instance_id = event.case_instance_id.clone();
    }
    if f.name.is_some() {
        entity.name = f.name.clone();
    }
    if f.assignee.is_some() {
        entity.assignee = f.assignee.clone();
    }
    if f.state.is_some() {
        entity.state = f.state.clone();
    }
    if f.create_time.is_some() {
        entity.create_time = f.create_time;
    }
    if f.end_time.is_some() {
        entity.end_time = f.end_time;
    }
    entity.last_updated_time = Some(event.last_update_time);
    entity
}

fn merge_activity(
    existing: Option<HistoricActivityInstance>,
    event: &HistoryEvent,
    f: &ActivityFields,
) -> HistoricActivityInstance {
    let mut entity = existing.unwrap_or_else(|| HistoricActivityInstance::new(&event.entity_id));
    if event.case_instance_id.is_some() {
        entity.case_instance_id = event.case_instance_id.clone();
    }
    if f.element_id.is_some() {
        entity.element_id = f.element_id.clone();
    }
    if f.element_name.is_some() {
        entity.element_name = f.element_name.clone();
    }
    if f.start_time.is_some() {
        entity.start_time = f.start_time;
    }
    if f.end_time.is_some() {
        entity.end_time = f.end_time;
    }
    entity.last_updated_time = Some(event.last_update_time);
    entity
}

// =============================================================================
// Case instances
// =============================================================================

pub struct CaseInstanceStartTransformer;

#[async_trait]
impl HistoryTransformer for CaseInstanceStartTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::CaseInstanceStart
    }

    async fn is_applicable(
        &self,
        _event: &HistoryEvent,
        _store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        let mut f: CaseInstanceFields = typed_fields(event)?;
        if f.start_time.is_none() {
            f.start_time = Some(event.last_update_time);
        }

        match store.get_case_instance(&event.entity_id).await? {
            None => {
                store
                    .insert_case_instance(&merge_case(None, event, &f))
                    .await?;
                Ok(Applied::Applied)
            }
            Some(existing) => {
                // Redelivery or late arrival after a newer event.
                let merged = merge_case(Some(existing), event, &f);
                if store.update_case_instance(&merged).await? {
                    Ok(Applied::Applied)
                } else {
                    Ok(Applied::Stale)
                }
            }
        }
    }
}

pub struct CaseInstanceUpdateTransformer;

#[async_trait]
impl HistoryTransformer for CaseInstanceUpdateTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::CaseInstanceUpdate
    }

    async fn is_applicable(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(store.get_case_instance(&event.entity_id).await?.is_some())
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        let f: CaseInstanceFields = typed_fields(event)?;
        let Some(existing) = store.get_case_instance(&event.entity_id).await? else {
            return Ok(Applied::Stale);
        };
        let merged = merge_case(Some(existing), event, &f);
        if store.update_case_instance(&merged).await? {
            Ok(Applied::Applied)
        } else {
            Ok(Applied::Stale)
        }
    }
}

pub struct CaseInstanceEndTransformer;

#[async_trait]
impl HistoryTransformer for CaseInstanceEndTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::CaseInstanceEnd
    }

    async fn is_applicable(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(store.get_case_instance(&event.entity_id).await?.is_some())
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        let mut f: CaseInstanceFields = typed_fields(event)?;
        if f.end_time.is_none() {
            f.end_time = Some(event.last_update_time);
        }
        if f.state.is_none() {
            f.state = Some("completed".to_string());
        }

        let Some(existing) = store.get_case_instance(&event.entity_id).await? else {
            return Ok(Applied::Stale);
        };
        let merged = merge_case(Some(existing), event, &f);
        if store.update_case_instance(&merged).await? {
            Ok(Applied::Applied)
        } else {
            Ok(Applied::Stale)
        }
    }
}

pub struct CaseInstanceDeleteTransformer;

#[async_trait]
impl HistoryTransformer for CaseInstanceDeleteTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::CaseInstanceDelete
    }

    async fn is_applicable(
        &self,
        _event: &HistoryEvent,
        _store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        // Deleting a never-seen or already-deleted case is a no-op.
        Ok(true)
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        if let Some(existing) = store.get_case_instance(&event.entity_id).await? {
            if !may_apply(event.last_update_time, existing.last_updated_time) {
                return Ok(Applied::Stale);
            }
        }
        store
            .delete_case_instance_cascade(&event.entity_id)
            .await?;
        Ok(Applied::Applied)
    }
}

// =============================================================================
// Tasks
// =============================================================================

pub struct TaskCreateTransformer;

#[async_trait]
impl HistoryTransformer for TaskCreateTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::TaskCreate
    }

    async fn is_applicable(
        &self,
        _event: &HistoryEvent,
        _store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        let mut f: TaskFields = typed_fields(event)?;
        if f.create_time.is_none() {
            f.create_time = Some(event.last_update_time);
        }

        match store.get_task(&event.entity_id).await? {
            None => {
                store.insert_task(&merge_task(None, event, &f)).await?;
                Ok(Applied::Applied)
            }
            Some(existing) => {
                let merged = merge_task(Some(existing), event, &f);
                if store.update_task(&merged).await? {
                    Ok(Applied::Applied)
                } else {
                    Ok(Applied::Stale)
                }
            }
        }
    }
}

pub struct TaskUpdateTransformer;

#[async_trait]
impl HistoryTransformer for TaskUpdateTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::TaskUpdate
    }

    async fn is_applicable(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(store.get_task(&event.entity_id).await?.is_some())
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        let f: TaskFields = typed_fields(event)?;
        let Some(existing) = store.get_task(&event.entity_id).await? else {
            return Ok(Applied::Stale);
        };
        let merged = merge_task(Some(existing), event, &f);
        if store.update_task(&merged).await? {
            Ok(Applied::Applied)
        } else {
            Ok(Applied::Stale)
        }
    }
}

pub struct TaskDeleteTransformer;

#[async_trait]
impl HistoryTransformer for TaskDeleteTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::TaskDelete
    }

    async fn is_applicable(
        &self,
        _event: &HistoryEvent,
        _store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        if let Some(existing) = store.get_task(&event.entity_id).await? {
            if !may_apply(event.last_update_time, existing.last_updated_time) {
                return Ok(Applied::Stale);
            }
        }
        store.delete_task(&event.entity_id).await?;
        Ok(Applied::Applied)
    }
}

// =============================================================================
// Activities
// =============================================================================

pub struct ActivityStartTransformer;

#[async_trait]
impl HistoryTransformer for ActivityStartTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::ActivityStart
    }

    async fn is_applicable(
        &self,
        _event: &HistoryEvent,
        _store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        let mut f: ActivityFields = typed_fields(event)?;
        if f.start_time.is_none() {
            f.start_time = Some(event.last_update_time);
        }

        match store.get_activity(&event.entity_id).await? {
            None => {
                store
                    .insert_activity(&merge_activity(None, event, &f))
                    .await?;
                Ok(Applied::Applied)
            }
            Some(existing) => {
                let merged = merge_activity(Some(existing), event, &f);
                if store.update_activity(&merged).await? {
                    Ok(Applied::Applied)
                } else {
                    Ok(Applied::Stale)
                }
            }
        }
    }
}

pub struct ActivityEndTransformer;

#[async_trait]
impl HistoryTransformer for ActivityEndTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::ActivityEnd
    }

    async fn is_applicable(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(store.get_activity(&event.entity_id).await?.is_some())
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        let mut f: ActivityFields = typed_fields(event)?;
        if f.end_time.is_none() {
            f.end_time = Some(event.last_update_time);
        }

        let Some(existing) = store.get_activity(&event.entity_id).await? else {
            return Ok(Applied::Stale);
        };
        let merged = merge_activity(Some(existing), event, &f);
        if store.update_activity(&merged).await? {
            Ok(Applied::Applied)
        } else {
            Ok(Applied::Stale)
        }
    }
}

// =============================================================================
// Variables
// =============================================================================

pub struct VariableSetTransformer;

#[async_trait]
impl HistoryTransformer for VariableSetTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::VariableSet
    }

    async fn is_applicable(
        &self,
        _event: &HistoryEvent,
        _store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        let f: VariableFields = typed_fields(event)?;

        let existing = store.get_variable(&event.entity_id).await?;
        let mut entity = existing
            .clone()
            .unwrap_or_else(|| HistoricVariable::new(&event.entity_id));
        if event.case_instance_id.is_some() {
            entity.case_instance_id = event.case_instance_id.clone();
        }
        if f.name.is_some() {
            entity.name = f.name.clone();
        }
        if f.value.is_some() {
            entity.value = f.value.clone();
        }
        entity.last_updated_time = Some(event.last_update_time);

        match existing {
            None => {
                store.insert_variable(&entity).await?;
                Ok(Applied::Applied)
            }
            Some(_) => {
                if store.update_variable(&entity).await? {
                    Ok(Applied::Applied)
                } else {
                    Ok(Applied::Stale)
                }
            }
        }
    }
}

pub struct VariableDeleteTransformer;

#[async_trait]
impl HistoryTransformer for VariableDeleteTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::VariableDelete
    }

    async fn is_applicable(
        &self,
        _event: &HistoryEvent,
        _store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        if let Some(existing) = store.get_variable(&event.entity_id).await? {
            if !may_apply(event.last_update_time, existing.last_updated_time) {
                return Ok(Applied::Stale);
            }
        }
        store.delete_variable(&event.entity_id).await?;
        Ok(Applied::Applied)
    }
}

// =============================================================================
// Entity links
// =============================================================================

pub struct EntityLinkCreateTransformer;

#[async_trait]
impl HistoryTransformer for EntityLinkCreateTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::EntityLinkCreate
    }

    async fn is_applicable(
        &self,
        _event: &HistoryEvent,
        _store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        let f: EntityLinkFields = typed_fields(event)?;

        if let Some(existing) = store.get_link(&event.entity_id).await? {
            if !may_apply(event.last_update_time, existing.last_updated_time) {
                return Ok(Applied::Stale);
            }
        }

        let mut entity = HistoricEntityLink::new(&event.entity_id);
        entity.case_instance_id = event.case_instance_id.clone();
        entity.link_type = f.link_type;
        entity.source_id = f.source_id;
        entity.target_id = f.target_id;
        entity.last_updated_time = Some(event.last_update_time);
        store.insert_link(&entity).await?;
        Ok(Applied::Applied)
    }
}

pub struct EntityLinkDeleteTransformer;

#[async_trait]
impl HistoryTransformer for EntityLinkDeleteTransformer {
    fn event_type(&self) -> HistoryEventType {
        HistoryEventType::EntityLinkDelete
    }

    async fn is_applicable(
        &self,
        _event: &HistoryEvent,
        _store: &dyn HistoryStore,
    ) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn apply(
        &self,
        event: &HistoryEvent,
        store: &dyn HistoryStore,
    ) -> Result<Applied, StoreError> {
        if let Some(existing) = store.get_link(&event.entity_id).await? {
            if !may_apply(event.last_update_time, existing.last_updated_time) {
                return Ok(Applied::Stale);
            }
        }
        store.delete_link(&event.entity_id).await?;
        Ok(Applied::Applied)
    }
}
