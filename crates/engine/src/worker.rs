//! Item worker contract and invoker
//!
//! The worker is supplied by the embedding application. The engine only
//! sees it through [`ItemWorker`] and always calls it through a
//! [`WorkerInvoker`], which turns every outcome (including timeouts and
//! panics) into an [`ItemResult`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::item::{ErrorKind, Item, ItemResult};

/// Default hard limit for a single worker call
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(30);

/// Error reported by a worker for one item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerFailure {
    /// Failure classification, drives retry decisions
    pub kind: ErrorKind,

    /// Error message
    pub message: String,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl WorkerFailure {
    /// A business or runtime failure, never retried by default
    pub fn worker(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::WorkerError, message)
    }

    /// A transient service failure, retried by default
    pub fn service(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::ServiceException, message)
    }

    /// The worker is being throttled, retried by default
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::TooManyRequests, message)
    }

    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for WorkerFailure {}

impl From<anyhow::Error> for WorkerFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::worker(err.to_string())
    }
}

/// A per-item processing function
///
/// Implementations must tolerate concurrent calls up to the engine's
/// configured concurrency cap.
///
/// # Example
///
/// ```ignore
/// struct Enrich;
///
/// #[async_trait]
/// impl ItemWorker for Enrich {
///     async fn process(&self, item: &Item) -> Result<serde_json::Value, WorkerFailure> {
///         Ok(json!({"itemId": item.item_id, "status": "processed"}))
///     }
/// }
/// ```
#[async_trait]
pub trait ItemWorker: Send + Sync + 'static {
    async fn process(&self, item: &Item) -> Result<serde_json::Value, WorkerFailure>;
}

type BoxedWorkerFuture =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, WorkerFailure>> + Send>>;

/// [`ItemWorker`] backed by an async closure
pub struct FnWorker {
    handler: Arc<dyn Fn(Item) -> BoxedWorkerFuture + Send + Sync>,
}

#[async_trait]
impl ItemWorker for FnWorker {
    async fn process(&self, item: &Item) -> Result<serde_json::Value, WorkerFailure> {
        (self.handler)(item.clone()).await
    }
}

/// Wrap an async closure as an [`ItemWorker`]
///
/// ```
/// use mapflow_engine::worker::{worker_fn, WorkerFailure};
///
/// let worker = worker_fn(|item| async move {
///     if item.item_id.is_empty() {
///         return Err(WorkerFailure::worker("missing id"));
///     }
///     Ok(serde_json::json!({"itemId": item.item_id}))
/// });
/// # let _ = worker;
/// ```
pub fn worker_fn<F, Fut>(handler: F) -> FnWorker
where
    F: Fn(Item) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, WorkerFailure>> + Send + 'static,
{
    FnWorker {
        handler: Arc::new(move |item| Box::pin(handler(item))),
    }
}

/// Calls the worker for one item at a time with a hard timeout
///
/// `invoke` never fails: timeouts, worker errors and worker panics all come
/// back as [`ItemResult::Failure`].
#[derive(Clone)]
pub struct WorkerInvoker {
    worker: Arc<dyn ItemWorker>,
    timeout: Duration,
}

impl WorkerInvoker {
    pub fn new(worker: Arc<dyn ItemWorker>) -> Self {
        Self {
            worker,
            timeout: DEFAULT_ITEM_TIMEOUT,
        }
    }

    /// Set the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke the worker for a single item
    pub async fn invoke(&self, item: &Item) -> ItemResult {
        let started = tokio::time::Instant::now();
        let call = AssertUnwindSafe(self.worker.process(item)).catch_unwind();

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(payload))) => {
                let elapsed = started.elapsed().as_millis() as u64;
                debug!(item_id = %item.item_id, processing_time_ms = elapsed, "item processed");
                ItemResult::success(item.item_id.clone(), payload, elapsed)
            }
            Ok(Ok(Err(failure))) => {
                debug!(item_id = %item.item_id, kind = %failure.kind, "worker reported failure");
                ItemResult::failure_with_details(
                    item.item_id.clone(),
                    failure.kind,
                    failure.message,
                    failure.details,
                )
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                warn!(item_id = %item.item_id, %reason, "worker panicked");
                ItemResult::failure(
                    item.item_id.clone(),
                    ErrorKind::WorkerError,
                    format!("worker panicked: {reason}"),
                )
            }
            Err(_) => {
                warn!(
                    item_id = %item.item_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "worker call timed out"
                );
                ItemResult::failure(
                    item.item_id.clone(),
                    ErrorKind::Timeout,
                    format!("worker did not respond within {:?}", self.timeout),
                )
            }
        }
    }
}

impl std::fmt::Debug for WorkerInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInvoker")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoker_for(worker: FnWorker) -> WorkerInvoker {
        WorkerInvoker::new(Arc::new(worker))
    }

    #[tokio::test]
    async fn test_success_payload() {
        let invoker = invoker_for(worker_fn(|item| async move {
            Ok(json!({"itemId": item.item_id, "status": "processed"}))
        }));

        let result = invoker.invoke(&Item::new("a", json!({}))).await;
        match result {
            ItemResult::Success { item_id, payload, .. } => {
                assert_eq!(item_id, "a");
                assert_eq!(payload["status"], "processed");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_failure_keeps_kind() {
        let invoker = invoker_for(worker_fn(|_| async {
            Err(WorkerFailure::throttled("slow down"))
        }));

        let result = invoker.invoke(&Item::new("a", json!({}))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::TooManyRequests));
        if let ItemResult::Failure { message, .. } = result {
            assert_eq!(message, "slow down");
        }
    }

    #[tokio::test]
    async fn test_failure_details_reach_result() {
        let invoker = invoker_for(worker_fn(|_| async {
            Err(WorkerFailure::worker("invalid order").with_details(json!({"field": "qty"})))
        }));

        let result = invoker.invoke(&Item::new("a", json!({}))).await;
        assert_eq!(result.details(), Some(&json!({"field": "qty"})));

        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded["details"]["field"], "qty");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_failure() {
        let invoker = invoker_for(worker_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }))
        .with_timeout(Duration::from_secs(2));

        let result = invoker.invoke(&Item::new("slow", json!({}))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let invoker = invoker_for(worker_fn(|item| async move {
            if item.item_id == "boom" {
                panic!("bad payload");
            }
            Ok(json!({}))
        }));

        let result = invoker.invoke(&Item::new("boom", json!({}))).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::WorkerError));
        if let ItemResult::Failure { message, .. } = result {
            assert!(message.contains("bad payload"));
        }
    }

    #[tokio::test]
    async fn test_invocations_are_independent() {
        let invoker = invoker_for(worker_fn(|item| async move {
            Ok(json!({"echo": item.payload}))
        }));
        let item = Item::new("same", json!({"n": 1}));

        let first = invoker.invoke(&item).await;
        let second = invoker.invoke(&item).await;

        for result in [first, second] {
            match result {
                ItemResult::Success { payload, .. } => assert_eq!(payload["echo"]["n"], 1),
                other => panic!("expected success, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_failure_from_anyhow() {
        let failure: WorkerFailure = anyhow::anyhow!("database unavailable").into();
        assert_eq!(failure.kind, ErrorKind::WorkerError);
        assert_eq!(failure.to_string(), "worker_error: database unavailable");
    }
}
