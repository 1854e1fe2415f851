//! Background job execution
//!
//! [`JobPoller`] claims eligible jobs with adaptive backoff;
//! [`JobWorker`] runs the poll loop, fans claimed jobs out to the
//! dispatcher under a concurrency limit, and releases any leases it
//! still holds on graceful shutdown.

mod poller;
mod runner;

pub use poller::{JobPoller, PollerConfig, PollerError};
pub use runner::{JobWorker, JobWorkerConfig, WorkerError, WorkerStatus};
