//! Job handler trait and the handler registry
//!
//! The registry is an explicit map built at startup: a finite set of
//! handler type tags is known at composition time, so there is no
//! reflection or scanning involved.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::Job;

/// Error returned by a job handler
///
/// The handler decides whether a failure is retryable. A fatal error
/// bypasses the remaining retry budget and escalates the job straight to
/// the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobHandlerError {
    /// Error message
    pub message: String,

    /// Additional detail (stack trace, response body) for diagnosis
    pub detail: Option<String>,

    /// Whether this failure forces immediate escalation
    pub fatal: bool,
}

impl JobHandlerError {
    /// A transient failure; the job will be retried while budget remains
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            fatal: false,
        }
    }

    /// A permanent failure; the job escalates immediately
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            fatal: true,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for JobHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for JobHandlerError {}

impl From<anyhow::Error> for JobHandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// A handler processes jobs of one handler type
///
/// Handlers are invoked synchronously from the dispatcher's point of view;
/// concurrency comes from multiple workers running dispatchers in
/// parallel.
///
/// # Example
///
/// ```ignore
/// struct ContinueCaseHandler;
///
/// #[async_trait]
/// impl JobHandler for ContinueCaseHandler {
///     fn handler_type(&self) -> &str {
///         "continue-case"
///     }
///
///     async fn execute(&self, job: &Job) -> Result<(), JobHandlerError> {
///         // Interpret job.payload and continue case execution...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// The handler type tag this handler is registered under
    fn handler_type(&self) -> &str;

    /// Process one job
    ///
    /// Return `JobHandlerError::retryable` for transient failures and
    /// `JobHandlerError::fatal` for permanent ones.
    async fn execute(&self, job: &Job) -> Result<(), JobHandlerError>;
}

/// Registry of job handlers, keyed by handler type
///
/// Built once at startup and shared read-only between workers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its own type tag
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .insert(handler.handler_type().to_string(), handler);
    }

    pub fn contains(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }

    pub fn resolve(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// All registered handler type tags
    pub fn handler_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handler_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        fn handler_type(&self) -> &str {
            "noop"
        }

        async fn execute(&self, _job: &Job) -> Result<(), JobHandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler));

        assert!(registry.contains("noop"));
        assert!(!registry.contains("unknown"));
        assert!(registry.resolve("noop").is_some());
        assert!(registry.resolve("unknown").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_execute() {
        let handler = NoopHandler;
        let job = Job::new(JobKind::AsyncContinuation, "noop", serde_json::json!({}));
        assert!(handler.execute(&job).await.is_ok());
    }

    #[test]
    fn test_error_constructors() {
        let retryable = JobHandlerError::retryable("timeout");
        assert!(!retryable.fatal);
        assert_eq!(retryable.to_string(), "timeout");

        let fatal = JobHandlerError::fatal("bad payload").with_detail("missing field x");
        assert!(fatal.fatal);
        assert_eq!(fatal.detail.as_deref(), Some("missing field x"));
    }

    #[test]
    fn test_error_from_anyhow() {
        let err: JobHandlerError = anyhow::anyhow!("boom").into();
        assert!(!err.fatal);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(NoopHandler));
        assert!(format!("{:?}", registry).contains("noop"));
    }
}
