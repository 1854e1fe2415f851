//! Retry and escalation: backoff policy and the failure path

mod failure;
mod retry;

pub use failure::{FailureOutcome, RetryHandler};
pub use retry::RetryPolicy;
