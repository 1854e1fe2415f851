//! HistoryStore trait definition

use async_trait::async_trait;

use super::entity::{
    HistoricActivityInstance, HistoricCaseInstance, HistoricEntityLink, HistoricTaskInstance,
    HistoricVariable,
};
use crate::persistence::StoreError;

/// Store for the denormalized historic read-model
///
/// One logical table per entity family. Every `update_*` is conditional on
/// the conflict rule: the write lands iff the stored `last_updated_time`
/// is absent or not newer than the incoming record's, and the return value
/// says whether it did. That per-entity compare-and-set is the only
/// consistency primitive the pipeline needs; inserts and deletes are
/// unconditional.
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    // =========================================================================
    // Case instances
    // =========================================================================

    async fn get_case_instance(
        &self,
        id: &str,
    ) -> Result<Option<HistoricCaseInstance>, StoreError>;

    async fn insert_case_instance(&self, entity: &HistoricCaseInstance)
        -> Result<(), StoreError>;

    /// Conditional full-record update; returns whether it applied
    async fn update_case_instance(
        &self,
        entity: &HistoricCaseInstance,
    ) -> Result<bool, StoreError>;

    /// Delete a case instance and cascade to every child entity
    /// referencing it (tasks, activities, variables, links)
    async fn delete_case_instance_cascade(&self, id: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Tasks
    // =========================================================================

    async fn get_task(&self, id: &str) -> Result<Option<HistoricTaskInstance>, StoreError>;

    async fn insert_task(&self, entity: &HistoricTaskInstance) -> Result<(), StoreError>;

    async fn update_task(&self, entity: &HistoricTaskInstance) -> Result<bool, StoreError>;

    async fn delete_task(&self, id: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Activities
    // =========================================================================

    async fn get_activity(
        &self,
        id: &str,
    ) -> Result<Option<HistoricActivityInstance>, StoreError>;

    async fn insert_activity(&self, entity: &HistoricActivityInstance)
        -> Result<(), StoreError>;

    async fn update_activity(
        &self,
        entity: &HistoricActivityInstance,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Variables
    // =========================================================================

    async fn get_variable(&self, id: &str) -> Result<Option<HistoricVariable>, StoreError>;

    async fn insert_variable(&self, entity: &HistoricVariable) -> Result<(), StoreError>;

    async fn update_variable(&self, entity: &HistoricVariable) -> Result<bool, StoreError>;

    async fn delete_variable(&self, id: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Entity links
    // =========================================================================

    async fn get_link(&self, id: &str) -> Result<Option<HistoricEntityLink>, StoreError>;

    async fn insert_link(&self, entity: &HistoricEntityLink) -> Result<(), StoreError>;

    async fn delete_link(&self, id: &str) -> Result<(), StoreError>;
}
