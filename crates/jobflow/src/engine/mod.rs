//! Execution engine: handler registry and the dispatch path

mod dispatcher;
mod registry;

pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
pub use registry::{HandlerRegistry, JobHandler, JobHandlerError};
