//! Reliability patterns for batch execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`Deadline`] - Wall-clock ceiling shared by everything in a batch

mod retry;
mod timeout;

pub(crate) use retry::duration_millis;
pub use retry::{with_retry, RetriedResult, RetryPolicy};
pub use timeout::Deadline;
