//! # Jobflow
//!
//! A PostgreSQL-backed background job engine for workflow and case runtimes.
//!
//! ## Features
//!
//! - **Durable job queue**: jobs survive restarts; dormant timers, async
//!   continuations, external-worker topics and message jobs share one model
//! - **Lease-based claiming**: workers claim jobs under expiring leases, so
//!   a crashed worker's jobs become claimable again without coordination
//! - **Bounded retries**: configurable backoff with jitter; exhausted or
//!   fatally-failed jobs land in a dead-letter queue operators can reinstate
//! - **History pipeline**: out-of-order audit events converge onto a
//!   denormalized read-model via per-entity logical timestamps
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       JobScheduler                          │
//! │  (producers enqueue timers, continuations, messages, ...)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         JobStore                            │
//! │  (PostgreSQL: jobflow_jobs, jobflow_deadletter_jobs)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  JobWorker + Dispatcher                     │
//! │  (claims under lease, runs handlers, routes failures to    │
//! │   retry or dead letter; TimerProjector promotes due timers)│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use jobflow::prelude::*;
//!
//! let store = Arc::new(PostgresJobStore::new(pool));
//! let scheduler = JobScheduler::new(store.clone());
//!
//! // Enqueue an escalation timer due in an hour.
//! scheduler
//!     .schedule(
//!         ScheduleRequest::new(JobKind::Timer, "escalate", json!({"case": case_id}))
//!             .with_due_date(Utc::now() + TimeDelta::hours(1))
//!             .with_correlation_id(case_id),
//!     )
//!     .await?;
//!
//! // Drain external-worker jobs for the "payments" topic.
//! let worker = JobWorker::new(
//!     store,
//!     dispatcher,
//!     clock,
//!     JobWorkerConfig::new(JobKind::ExternalWorker).with_topic("payments"),
//! );
//! worker.start()?;
//! ```

pub mod clock;
pub mod engine;
pub mod history;
pub mod job;
pub mod lease;
pub mod persistence;
pub mod reliability;
pub mod scheduler;
pub mod timer;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::engine::{
        DispatchOutcome, Dispatcher, HandlerRegistry, JobHandler, JobHandlerError,
    };
    pub use crate::history::{
        HistoryEvent, HistoryEventType, HistoryJobHandler, HistoryStore, InMemoryHistoryStore,
        PostgresHistoryStore, HISTORY_JOB_HANDLER_TYPE,
    };
    pub use crate::job::{Job, JobKind};
    pub use crate::lease::LeaseManager;
    pub use crate::persistence::{
        InMemoryJobStore, JobFilter, JobStore, Pagination, PostgresJobStore, StoreError,
    };
    pub use crate::reliability::{FailureOutcome, RetryHandler, RetryPolicy};
    pub use crate::scheduler::{JobAdmin, JobScheduler, ScheduleRequest};
    pub use crate::timer::{TimerProjector, TimerProjectorConfig};
    pub use crate::worker::{JobWorker, JobWorkerConfig, PollerConfig, WorkerError};
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{DispatchOutcome, Dispatcher, HandlerRegistry, JobHandler, JobHandlerError};
pub use history::{
    HistoryEvent, HistoryEventType, HistoryJobHandler, HistoryStore, InMemoryHistoryStore,
    PostgresHistoryStore, HISTORY_JOB_HANDLER_TYPE,
};
pub use job::{Job, JobKind};
pub use lease::LeaseManager;
pub use persistence::{
    InMemoryJobStore, JobFilter, JobStore, Pagination, PostgresJobStore, StoreError,
};
pub use reliability::{FailureOutcome, RetryHandler, RetryPolicy};
pub use scheduler::{JobAdmin, JobScheduler, ScheduleRequest};
pub use timer::{TimerProjector, TimerProjectorConfig};
pub use worker::{JobWorker, JobWorkerConfig, PollerConfig, WorkerError, WorkerStatus};
