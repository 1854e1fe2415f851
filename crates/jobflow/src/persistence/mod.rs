//! Persistence layer: the job store trait and its implementations

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use store::{JobFilter, JobStore, Pagination, StoreError};
