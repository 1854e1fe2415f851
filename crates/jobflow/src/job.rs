//! The job record: a persisted unit of deferred work
//!
//! A `Job` is the central entity of the subsystem. It carries scheduling
//! metadata (due date, retry budget), lease metadata (owner + expiry), and
//! failure context. The payload is opaque to everything except the handler
//! registered for its `handler_type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which queue a job lives in and which class of handler processes it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Not runnable until its due date; promoted to an executable job when due
    Timer,
    /// Executable continuation of engine work
    AsyncContinuation,
    /// Claimed and completed by an external worker integration
    ExternalWorker,
    /// Serialized state-change record applied to the historic read-model
    HistoryEvent,
    /// Buffered message delivery
    Message,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::AsyncContinuation => "async_continuation",
            Self::ExternalWorker => "external_worker",
            Self::HistoryEvent => "history_event",
            Self::Message => "message",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timer" => Ok(Self::Timer),
            "async_continuation" => Ok(Self::AsyncContinuation),
            "external_worker" => Ok(Self::ExternalWorker),
            "history_event" => Ok(Self::HistoryEvent),
            "message" => Ok(Self::Message),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// A persisted unit of deferred work
///
/// Lease invariant: `lock_owner` and `lock_expiration_time` are either both
/// set or both absent. A lease whose expiry is in the past is logically
/// unleased and may be reclaimed by any worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,

    /// Selects the registered handler that processes this job
    pub handler_type: String,

    /// Opaque blob, interpreted only by the handler
    pub payload: serde_json::Value,

    /// Not eligible before this instant; `None` means immediately eligible
    pub due_date: Option<DateTime<Utc>>,

    /// Decremented on handler failure; reaching 0 escalates to the
    /// dead-letter queue
    pub retries_remaining: u32,

    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,

    /// Stable across retries and queue-to-queue transitions even as `id`
    /// changes; external callers use it to locate "their" job
    pub correlation_id: String,

    pub exception_message: Option<String>,
    pub exception_detail: Option<String>,

    // Ownership/partitioning attributes, used only for filtering
    pub scope_id: Option<String>,
    pub scope_type: Option<String>,
    pub tenant_id: Option<String>,

    // Origin metadata for observability
    pub element_id: Option<String>,
    pub element_name: Option<String>,

    pub create_time: DateTime<Utc>,
}

impl Job {
    /// Default retry budget for new jobs
    pub const DEFAULT_RETRIES: u32 = 3;

    pub fn new(kind: JobKind, handler_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            handler_type: handler_type.into(),
            payload,
            due_date: None,
            retries_remaining: Self::DEFAULT_RETRIES,
            lock_owner: None,
            lock_expiration_time: None,
            correlation_id: Uuid::now_v7().to_string(),
            exception_message: None,
            exception_detail: None,
            scope_id: None,
            scope_type: None,
            tenant_id: None,
            element_id: None,
            element_name: None,
            create_time: Utc::now(),
        }
    }

    pub fn with_due_date(mut self, due: DateTime<Utc>) -> Self {
        self.due_date = Some(due);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = retries;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>, scope_type: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self.scope_type = Some(scope_type.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_element(mut self, element_id: impl Into<String>, element_name: impl Into<String>) -> Self {
        self.element_id = Some(element_id.into());
        self.element_name = Some(element_name.into());
        self
    }

    /// Whether a live lease is held at `now`
    ///
    /// An expired lease does not count: the job is reclaimable.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match (&self.lock_owner, self.lock_expiration_time) {
            (Some(_), Some(expiry)) => expiry > now,
            _ => false,
        }
    }

    /// Whether the job may be claimed for execution at `now`
    ///
    /// Eligible means: due date reached (or absent), retries remaining, and
    /// no live lease.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.retries_remaining == 0 {
            return false;
        }
        if let Some(due) = self.due_date {
            if due > now {
                return false;
            }
        }
        !self.is_locked(now)
    }

    /// Clear the lease fields
    pub fn clear_lease(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }
}
