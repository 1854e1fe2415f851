//! Denormalized historic read-model records
//!
//! One record type per real-world concept. Each carries a
//! `last_updated_time` used only by the conflict rule: a mutation is
//! applied iff the entity has no stored timestamp yet, or the event's
//! timestamp is not strictly older. Equal timestamps apply (last delivery
//! wins on exact ties).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether an event timestamp may mutate an entity with the given stored
/// timestamp
pub fn may_apply(event_time: DateTime<Utc>, stored: Option<DateTime<Utc>>) -> bool {
    match stored {
        None => true,
        Some(stored) => event_time >= stored,
    }
}

/// Historic record of a case/process instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricCaseInstance {
    pub id: String,
    pub name: Option<String>,
    pub business_key: Option<String>,
    pub state: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tenant_id: Option<String>,
    pub last_updated_time: Option<DateTime<Utc>>,
}

impl HistoricCaseInstance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Historic record of a human task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricTaskInstance {
    pub id: String,
    pub case_instance_id: Option<String>,
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub state: Option<String>,
    pub create_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated_time: Option<DateTime<Utc>>,
}

impl HistoricTaskInstance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Historic record of a plan-item/activity instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricActivityInstance {
    pub id: String,
    pub case_instance_id: Option<String>,
    pub element_id: Option<String>,
    pub element_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_updated_time: Option<DateTime<Utc>>,
}

impl HistoricActivityInstance {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Historic record of a variable value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricVariable {
    pub id: String,
    pub case_instance_id: Option<String>,
    pub name: Option<String>,
    pub value: Option<serde_json::Value>,
    pub last_updated_time: Option<DateTime<Utc>>,
}

impl HistoricVariable {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Historic record of a link between two entities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricEntityLink {
    pub id: String,
    pub case_instance_id: Option<String>,
    pub link_type: Option<String>,
    pub source_id: Option<String>,
    pub target_id: Option<String>,
    pub last_updated_time: Option<DateTime<Utc>>,
}

impl HistoricEntityLink {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_may_apply() {
        let t = Utc::now();

        // No stored timestamp: always applies.
        assert!(may_apply(t, None));
        // Newer event applies, equal applies, strictly older does not.
        assert!(may_apply(t, Some(t - TimeDelta::seconds(1))));
        assert!(may_apply(t, Some(t)));
        assert!(!may_apply(t, Some(t + TimeDelta::seconds(1))));
    }
}
