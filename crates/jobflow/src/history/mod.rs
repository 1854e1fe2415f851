//! Async history pipeline
//!
//! History events are jobs like any other: a producer serializes a
//! state-change record into a job payload at the moment the change
//! happened, and this pipeline later applies it to the denormalized
//! historic read-model. Delivery order is not guaranteed; convergence
//! relies on the logical timestamp each event carries.

mod entity;
mod event;
mod handler;
mod memory;
mod postgres;
mod store;
mod transformer;
mod transformers;

pub use entity::{
    HistoricActivityInstance, HistoricCaseInstance, HistoricEntityLink, HistoricTaskInstance,
    HistoricVariable,
};
pub use event::{
    ActivityFields, CaseInstanceFields, EntityLinkFields, HistoryEvent, HistoryEventType,
    TaskFields, VariableFields, HISTORY_JOB_HANDLER_TYPE,
};
pub use handler::HistoryJobHandler;
pub use memory::InMemoryHistoryStore;
pub use postgres::PostgresHistoryStore;
pub use store::HistoryStore;
pub use transformer::{Applied, HistoryTransformer, HistoryTransformerRegistry};
