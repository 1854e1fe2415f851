//! History event records carried in job payloads

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::engine::JobHandlerError;

/// Handler type tag under which all history-event jobs are scheduled
pub const HISTORY_JOB_HANDLER_TYPE: &str = "async-history";

/// Which transformer processes an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    CaseInstanceStart,
    CaseInstanceUpdate,
    CaseInstanceEnd,
    CaseInstanceDelete,
    TaskCreate,
    TaskUpdate,
    TaskDelete,
    ActivityStart,
    ActivityEnd,
    VariableSet,
    VariableDelete,
    EntityLinkCreate,
    EntityLinkDelete,
}

impl std::fmt::Display for HistoryEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CaseInstanceStart => "case_instance_start",
            Self::CaseInstanceUpdate => "case_instance_update",
            Self::CaseInstanceEnd => "case_instance_end",
            Self::CaseInstanceDelete => "case_instance_delete",
            Self::TaskCreate => "task_create",
            Self::TaskUpdate => "task_update",
            Self::TaskDelete => "task_delete",
            Self::ActivityStart => "activity_start",
            Self::ActivityEnd => "activity_end",
            Self::VariableSet => "variable_set",
            Self::VariableDelete => "variable_delete",
            Self::EntityLinkCreate => "entity_link_create",
            Self::EntityLinkDelete => "entity_link_delete",
        };
        write!(f, "{s}")
    }
}

/// A serialized state-change record
///
/// `last_update_time` is assigned by the producer at the moment the
/// real-world change occurred (not at enqueue or dequeue time) and is
/// the sole ordering authority when conflicting events meet at the same
/// historic entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    pub event_type: HistoryEventType,

    /// Identity of the historic entity this event targets
    pub entity_id: String,

    /// Owning case instance, for child entities (tasks, activities,
    /// variables, links)
    pub case_instance_id: Option<String>,

    /// Named field values, interpreted per event type
    pub fields: serde_json::Value,

    /// Producer-assigned logical timestamp
    pub last_update_time: DateTime<Utc>,
}

impl HistoryEvent {
    pub fn new(
        event_type: HistoryEventType,
        entity_id: impl Into<String>,
        last_update_time: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            entity_id: entity_id.into(),
            case_instance_id: None,
            fields: serde_json::json!({}),
            last_update_time,
        }
    }

    pub fn with_case_instance(mut self, case_instance_id: impl Into<String>) -> Self {
        self.case_instance_id = Some(case_instance_id.into());
        self
    }

    pub fn with_fields<T: Serialize>(mut self, fields: &T) -> Result<Self, serde_json::Error> {
        self.fields = serde_json::to_value(fields)?;
        Ok(self)
    }

    /// Deserialize the field map into a typed view
    pub fn fields_as<T: DeserializeOwned>(&self) -> Result<T, JobHandlerError> {
        serde_json::from_value(self.fields.clone()).map_err(|e| {
            JobHandlerError::fatal(format!("malformed history event fields: {e}"))
        })
    }

    /// Serialize into a job payload
    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Deserialize from a job payload
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, JobHandlerError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| JobHandlerError::fatal(format!("malformed history event payload: {e}")))
    }
}

/// Field values for case-instance events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseInstanceFields {
    pub name: Option<String>,
    pub business_key: Option<String>,
    pub state: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tenant_id: Option<String>,
}

/// Field values for task events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFields {
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub state: Option<String>,
    pub create_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Field values for activity events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityFields {
    pub element_id: Option<String>,
    pub element_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Field values for variable events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableFields {
    pub name: Option<String>,
    pub value: Option<serde_json::Value>,
}

/// Field values for entity-link events
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityLinkFields {
    pub link_type: Option<String>,
    pub source_id: Option<String>,
    pub target_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let event = HistoryEvent::new(HistoryEventType::TaskCreate, "task-1", Utc::now())
            .with_case_instance("case-1")
            .with_fields(&TaskFields {
                name: Some("Review order".to_string()),
                ..Default::default()
            })
            .unwrap();

        let payload = event.to_payload().unwrap();
        let parsed = HistoryEvent::from_payload(&payload).unwrap();
        assert_eq!(parsed, event);

        let fields: TaskFields = parsed.fields_as().unwrap();
        assert_eq!(fields.name.as_deref(), Some("Review order"));
    }

    #[test]
    fn test_malformed_payload_is_fatal() {
        let err = HistoryEvent::from_payload(&serde_json::json!({"nope": true})).unwrap_err();
        assert!(err.fatal);
    }
}
