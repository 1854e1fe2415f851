//! PostgreSQL implementation of HistoryStore
//!
//! One table per entity family. Conditional updates are expressed as a
//! single UPDATE guarded on `last_updated_time`, so the conflict rule is
//! enforced by the database rather than by read-modify-write in the
//! application.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::entity::{
    HistoricActivityInstance, HistoricCaseInstance, HistoricEntityLink, HistoricTaskInstance,
    HistoricVariable,
};
use super::store::HistoryStore;
use crate::persistence::StoreError;

/// PostgreSQL implementation of HistoryStore
///
/// Tables `jobflow_hist_case_instances`, `jobflow_hist_tasks`,
/// `jobflow_hist_activities`, `jobflow_hist_variables` and
/// `jobflow_hist_links`; schema in the crate's `migrations/` directory.
#[derive(Clone)]
pub struct PostgresHistoryStore {
    pool: PgPool,
}

impl PostgresHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_case(row: &PgRow) -> HistoricCaseInstance {
    HistoricCaseInstance {
        id: row.get("id"),
        name: row.get("name"),
        business_key: row.get("business_key"),
        state: row.get("state"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        tenant_id: row.get("tenant_id"),
        last_updated_time: row.get("last_updated_time"),
    }
}

fn row_to_task(row: &PgRow) -> HistoricTaskInstance {
    HistoricTaskInstance {
        id: row.get("id"),
        case_instance_id: row.get("case_instance_id"),
        name: row.get("name"),
        assignee: row.get("assignee"),
        state: row.get("state"),
        create_time: row.get("create_time"),
        end_time: row.get("end_time"),
        last_updated_time: row.get("last_updated_time"),
    }
}

fn row_to_activity(row: &PgRow) -> HistoricActivityInstance {
    HistoricActivityInstance {
        id: row.get("id"),
        case_instance_id: row.get("case_instance_id"),
        element_id: row.get("element_id"),
        element_name: row.get("element_name"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        last_updated_time: row.get("last_updated_time"),
    }
}

fn row_to_variable(row: &PgRow) -> HistoricVariable {
    HistoricVariable {
        id: row.get("id"),
        case_instance_id: row.get("case_instance_id"),
        name: row.get("name"),
        value: row.get("value"),
        last_updated_time: row.get("last_updated_time"),
    }
}

fn row_to_link(row: &PgRow) -> HistoricEntityLink {
    HistoricEntityLink {
        id: row.get("id"),
        case_instance_id: row.get("case_instance_id"),
        link_type: row.get("link_type"),
        source_id: row.get("source_id"),
        target_id: row.get("target_id"),
        last_updated_time: row.get("last_updated_time"),
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    // =========================================================================
    // Case instances
    // =========================================================================

    async fn get_case_instance(
        &self,
        id: &str,
    ) -> Result<Option<HistoricCaseInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, business_key, state, start_time, end_time, tenant_id, \
             last_updated_time FROM jobflow_hist_case_instances WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.as_ref().map(row_to_case))
    }

    async fn insert_case_instance(
        &self,
        entity: &HistoricCaseInstance,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobflow_hist_case_instances \
             (id, name, business_key, state, start_time, end_time, tenant_id, last_updated_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&entity.id)
        .bind(&entity.name)
        .bind(&entity.business_key)
        .bind(&entity.state)
        .bind(entity.start_time)
        .bind(entity.end_time)
        .bind(&entity.tenant_id)
        .bind(entity.last_updated_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn update_case_instance(
        &self,
        entity: &HistoricCaseInstance,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobflow_hist_case_instances SET \
             name = $2, business_key = $3, state = $4, start_time = $5, end_time = $6, \
             tenant_id = $7, last_updated_time = $8 \
             WHERE id = $1 AND (last_updated_time IS NULL OR last_updated_time <= $8)",
        )
        .bind(&entity.id)
        .bind(&entity.name)
        .bind(&entity.business_key)
        .bind(&entity.state)
        .bind(entity.start_time)
        .bind(entity.end_time)
        .bind(&entity.tenant_id)
        .bind(entity.last_updated_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_case_instance_cascade(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for table in [
            "jobflow_hist_tasks",
            "jobflow_hist_activities",
            "jobflow_hist_variables",
            "jobflow_hist_links",
        ] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE case_instance_id = $1"
            ))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        sqlx::query("DELETE FROM jobflow_hist_case_instances WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    async fn get_task(&self, id: &str) -> Result<Option<HistoricTaskInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT id, case_instance_id, name, assignee, state, create_time, end_time, \
             last_updated_time FROM jobflow_hist_tasks WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.as_ref().map(row_to_task))
    }

    async fn insert_task(&self, entity: &HistoricTaskInstance) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobflow_hist_tasks \
             (id, case_instance_id, name, assignee, state, create_time, end_time, last_updated_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&entity.id)
        .bind(&entity.case_instance_id)
        .bind(&entity.name)
        .bind(&entity.assignee)
        .bind(&entity.state)
        .bind(entity.create_time)
        .bind(entity.end_time)
        .bind(entity.last_updated_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn update_task(&self, entity: &HistoricTaskInstance) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobflow_hist_tasks SET \
             case_instance_id = $2, name = $3, assignee = $4, state = $5, create_time = $6, \
             end_time = $7, last_updated_time = $8 \
             WHERE id = $1 AND (last_updated_time IS NULL OR last_updated_time <= $8)",
        )
        .bind(&entity.id)
        .bind(&entity.case_instance_id)
        .bind(&entity.name)
        .bind(&entity.assignee)
        .bind(&entity.state)
        .bind(entity.create_time)
        .bind(entity.end_time)
        .bind(entity.last_updated_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_task(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobflow_hist_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    // =========================================================================
    // Activities
    // =========================================================================

    async fn get_activity(
        &self,
        id: &str,
    ) -> Result<Option<HistoricActivityInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT id, case_instance_id, element_id, element_name, start_time, end_time, \
             last_updated_time FROM jobflow_hist_activities WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.as_ref().map(row_to_activity))
    }

    async fn insert_activity(
        &self,
        entity: &HistoricActivityInstance,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobflow_hist_activities \
             (id, case_instance_id, element_id, element_name, start_time, end_time, last_updated_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&entity.id)
        .bind(&entity.case_instance_id)
        .bind(&entity.element_id)
        .bind(&entity.element_name)
        .bind(entity.start_time)
        .bind(entity.end_time)
        .bind(entity.last_updated_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn update_activity(
        &self,
        entity: &HistoricActivityInstance,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobflow_hist_activities SET \
             case_instance_id = $2, element_id = $3, element_name = $4, start_time = $5, \
             end_time = $6, last_updated_time = $7 \
             WHERE id = $1 AND (last_updated_time IS NULL OR last_updated_time <= $7)",
        )
        .bind(&entity.id)
        .bind(&entity.case_instance_id)
        .bind(&entity.element_id)
        .bind(&entity.element_name)
        .bind(entity.start_time)
        .bind(entity.end_time)
        .bind(entity.last_updated_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Variables
    // =========================================================================

    async fn get_variable(&self, id: &str) -> Result<Option<HistoricVariable>, StoreError> {
        let row = sqlx::query(
            "SELECT id, case_instance_id, name, value, last_updated_time \
             FROM jobflow_hist_variables WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.as_ref().map(row_to_variable))
    }

    async fn insert_variable(&self, entity: &HistoricVariable) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO jobflow_hist_variables \
             (id, case_instance_id, name, value, last_updated_time) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&entity.id)
        .bind(&entity.case_instance_id)
        .bind(&entity.name)
        .bind(&entity.value)
        .bind(entity.last_updated_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn update_variable(&self, entity: &HistoricVariable) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobflow_hist_variables SET \
             case_instance_id = $2, name = $3, value = $4, last_updated_time = $5 \
             WHERE id = $1 AND (last_updated_time IS NULL OR last_updated_time <= $5)",
        )
        .bind(&entity.id)
        .bind(&entity.case_instance_id)
        .bind(&entity.name)
        .bind(&entity.value)
        .bind(entity.last_updated_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_variable(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobflow_hist_variables WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    // =========================================================================
    // Entity links
    // =========================================================================

    async fn get_link(&self, id: &str) -> Result<Option<HistoricEntityLink>, StoreError> {
        let row = sqlx::query(
            "SELECT id, case_instance_id, link_type, source_id, target_id, last_updated_time \
             FROM jobflow_hist_links WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.as_ref().map(row_to_link))
    }

    async fn insert_link(&self, entity: &HistoricEntityLink) -> Result<(), StoreError> {
        // Upsert: a redelivered create replaces the row it created.
        sqlx::query(
            "INSERT INTO jobflow_hist_links \
             (id, case_instance_id, link_type, source_id, target_id, last_updated_time) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO UPDATE SET \
             case_instance_id = EXCLUDED.case_instance_id, link_type = EXCLUDED.link_type, \
             source_id = EXCLUDED.source_id, target_id = EXCLUDED.target_id, \
             last_updated_time = EXCLUDED.last_updated_time",
        )
        .bind(&entity.id)
        .bind(&entity.case_instance_id)
        .bind(&entity.link_type)
        .bind(&entity.source_id)
        .bind(&entity.target_id)
        .bind(entity.last_updated_time)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete_link(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobflow_hist_links WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }
}
