//! Execution coordinator
//!
//! Owns every batch from submission to its terminal status. The coordinator
//! is the only component that picks an executor for a strategy; executors
//! never see each other.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::batch::{Batch, BatchResult, StrategyConfig, StrategyKind, ValidationError};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{executor_for, ExecutionControl, Interruption, MapOutcome};
use crate::item::Item;
use crate::observability::{ExecutionRecord, ExecutionRecordSink, TracingRecordSink};
use crate::policy::Verdict;
use crate::state::{BatchEvent, BatchStateMachine, BatchStatus};
use crate::worker::{ItemWorker, WorkerInvoker};

const CANCELLED_BY_CALLER: &str = "cancelled by caller";

/// Point-in-time view of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub strategy: StrategyKind,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub submitted_count: usize,
    pub submitted_at: DateTime<Utc>,
    /// Present once the final result is published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<ExecutionRecord>,
}

struct ExecutionEntry {
    strategy: StrategyKind,
    submitted_count: usize,
    submitted_at: DateTime<Utc>,
    cancel: CancellationToken,
    state: Arc<RwLock<BatchStateMachine>>,
    result: watch::Receiver<Option<BatchResult>>,
}

/// Accepts batches, runs them with the selected strategy and tracks them
/// until they finish
///
/// Cloning is cheap; clones share the same executions. `submit` forgets
/// the execution once it hands back the result; executions run with
/// `start` stay pollable until `remove`, or until more than
/// `finished_retention` newer executions have finished.
///
/// # Example
///
/// ```ignore
/// let coordinator = ExecutionCoordinator::new(Arc::new(worker));
///
/// // Blocking style
/// let result = coordinator.submit(items, StrategyConfig::inline()).await?;
///
/// // Async style
/// let id = coordinator.start(items, StrategyConfig::distributed(5, 10.0))?;
/// let snapshot = coordinator.poll(id)?;
/// let result = coordinator.wait(id).await?;
/// ```
#[derive(Clone)]
pub struct ExecutionCoordinator {
    invoker: WorkerInvoker,
    config: Arc<EngineConfig>,
    sinks: Arc<Vec<Arc<dyn ExecutionRecordSink>>>,
    executions: Arc<DashMap<Uuid, ExecutionEntry>>,
    /// Finished execution ids, oldest first
    finished: Arc<Mutex<VecDeque<Uuid>>>,
}

impl ExecutionCoordinator {
    /// Coordinator with default configuration and a tracing record sink
    pub fn new(worker: Arc<dyn ItemWorker>) -> Self {
        Self::with_config(worker, EngineConfig::default())
    }

    pub fn with_config(worker: Arc<dyn ItemWorker>, config: EngineConfig) -> Self {
        let invoker = WorkerInvoker::new(worker).with_timeout(config.item_timeout);
        Self {
            invoker,
            config: Arc::new(config),
            sinks: Arc::new(vec![Arc::new(TracingRecordSink)]),
            executions: Arc::new(DashMap::new()),
            finished: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Add a record sink
    pub fn with_sink(mut self, sink: Arc<dyn ExecutionRecordSink>) -> Self {
        Arc::make_mut(&mut self.sinks).push(sink);
        self
    }

    /// Replace all record sinks
    pub fn with_sinks(mut self, sinks: Vec<Arc<dyn ExecutionRecordSink>>) -> Self {
        self.sinks = Arc::new(sinks);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a batch and wait for its result, using the configured batch timeout
    pub async fn submit(&self, items: Vec<Item>, strategy: StrategyConfig) -> Result<BatchResult> {
        self.submit_with_timeout(items, strategy, self.config.batch_timeout)
            .await
    }

    /// Run a batch with its own timeout and wait for its result
    pub async fn submit_with_timeout(
        &self,
        items: Vec<Item>,
        strategy: StrategyConfig,
        timeout: Duration,
    ) -> Result<BatchResult> {
        let execution_id = self.start_with_timeout(items, strategy, timeout)?;
        let result = self.wait(execution_id).await;
        self.forget(execution_id);
        result
    }

    /// Run a batch with the configured strategy for `kind`
    pub async fn submit_kind(&self, items: Vec<Item>, kind: StrategyKind) -> Result<BatchResult> {
        self.submit(items, self.config.strategy(kind)).await
    }

    /// Start a batch in the background and return its execution id
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, items: Vec<Item>, strategy: StrategyConfig) -> Result<Uuid> {
        self.start_with_timeout(items, strategy, self.config.batch_timeout)
    }

    /// Start a batch with the configured strategy for `kind`
    pub fn start_kind(&self, items: Vec<Item>, kind: StrategyKind) -> Result<Uuid> {
        self.start(items, self.config.strategy(kind))
    }

    /// Start a batch with its own timeout
    pub fn start_with_timeout(
        &self,
        items: Vec<Item>,
        strategy: StrategyConfig,
        timeout: Duration,
    ) -> Result<Uuid> {
        strategy.validate()?;
        if timeout.is_zero() {
            return Err(ValidationError::ZeroBatchTimeout.into());
        }
        if self.invoker.timeout().is_zero() {
            return Err(ValidationError::ZeroItemTimeout.into());
        }

        let batch = Batch::new(items, strategy, timeout);
        let execution_id = batch.execution_id;
        let cancel = CancellationToken::new();
        let state = Arc::new(RwLock::new(BatchStateMachine::new(execution_id)));
        let (tx, rx) = watch::channel(None);

        self.executions.insert(
            execution_id,
            ExecutionEntry {
                strategy: batch.strategy.kind(),
                submitted_count: batch.len(),
                submitted_at: Utc::now(),
                cancel: cancel.clone(),
                state: state.clone(),
                result: rx,
            },
        );

        info!(
            execution_id = %execution_id,
            strategy = %batch.strategy.kind(),
            items = batch.len(),
            timeout_ms = timeout.as_millis() as u64,
            "batch submitted"
        );

        let coordinator = self.clone();
        tokio::spawn(async move {
            let result = coordinator.execute(batch, state, cancel).await;
            coordinator.retain_finished(execution_id);
            tx.send_replace(Some(result));
        });

        Ok(execution_id)
    }

    /// Current status of an execution
    pub fn poll(&self, execution_id: Uuid) -> Result<ExecutionSnapshot> {
        let entry = self
            .executions
            .get(&execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        let (status, cause) = {
            let state = entry.state.read();
            (state.status(), state.cause().map(str::to_string))
        };
        let record = entry
            .result
            .borrow()
            .as_ref()
            .map(ExecutionRecord::from_result);

        Ok(ExecutionSnapshot {
            execution_id,
            strategy: entry.strategy,
            status,
            cause,
            submitted_count: entry.submitted_count,
            submitted_at: entry.submitted_at,
            record,
        })
    }

    /// Cancel a pending or running execution
    ///
    /// The batch moves to `Cancelled` immediately. Items not yet dispatched
    /// never start; dispatched ones finish or hit the deadline and still
    /// appear in the result.
    pub fn cancel(&self, execution_id: Uuid) -> Result<BatchStatus> {
        let entry = self
            .executions
            .get(&execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        {
            let mut state = entry.state.write();
            if state.status().is_terminal() {
                return Err(EngineError::AlreadyFinished {
                    execution_id,
                    status: state.status(),
                });
            }
            state.transition(BatchEvent::Cancel(CANCELLED_BY_CALLER.to_string()))?;
        }
        entry.cancel.cancel();

        info!(execution_id = %execution_id, "batch cancelled");
        Ok(BatchStatus::Cancelled)
    }

    /// Wait for an execution's final result
    pub async fn wait(&self, execution_id: Uuid) -> Result<BatchResult> {
        let mut rx = self
            .executions
            .get(&execution_id)
            .map(|entry| entry.result.clone())
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        let result = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::Abandoned(execution_id))?
            .clone();
        result.ok_or(EngineError::Abandoned(execution_id))
    }

    /// Final result if the execution has finished
    pub fn result(&self, execution_id: Uuid) -> Result<BatchResult> {
        let entry = self
            .executions
            .get(&execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let result = entry.result.borrow().clone();
        result.ok_or(EngineError::ResultUnavailable(execution_id))
    }

    /// Stop tracking a finished execution, returning its result
    pub fn remove(&self, execution_id: Uuid) -> Result<BatchResult> {
        let result = self.result(execution_id)?;
        self.forget(execution_id);
        Ok(result)
    }

    /// Number of tracked executions
    pub fn execution_count(&self) -> usize {
        self.executions.len()
    }

    fn forget(&self, execution_id: Uuid) {
        self.executions.remove(&execution_id);
        self.finished.lock().retain(|id| *id != execution_id);
    }

    /// Record a finished execution and evict the oldest past the retention
    /// bound; the newest finished execution is always kept
    fn retain_finished(&self, execution_id: Uuid) {
        let evicted: Vec<Uuid> = {
            let mut finished = self.finished.lock();
            finished.push_back(execution_id);
            let excess = finished
                .len()
                .saturating_sub(self.config.finished_retention.max(1));
            finished.drain(..excess).collect()
        };
        for id in evicted {
            self.executions.remove(&id);
            debug!(execution_id = %id, "evicted finished execution");
        }
    }

    #[instrument(
        skip_all,
        fields(
            execution_id = %batch.execution_id,
            strategy = %batch.strategy.kind(),
            items = batch.len()
        )
    )]
    async fn execute(
        &self,
        batch: Batch,
        state: Arc<RwLock<BatchStateMachine>>,
        cancel: CancellationToken,
    ) -> BatchResult {
        let started_at = Utc::now();
        let executor = executor_for(&batch.strategy, self.invoker.clone());

        let started = state.write().transition(BatchEvent::Start);
        let outcome = match started {
            Ok(_) => {
                debug!("batch running");
                let control = ExecutionControl::new(batch.timeout, cancel);
                executor.run(&batch.items, &control).await
            }
            Err(e) => {
                debug!(error = %e, "batch never started");
                MapOutcome {
                    items: Vec::new(),
                    interruption: Some(Interruption::Cancelled),
                }
            }
        };

        let tally = outcome.tally();
        let event = match outcome.interruption {
            Some(Interruption::TimedOut) => BatchEvent::TimeOut(format!(
                "timed out after {:?} with {} of {} items completed",
                batch.timeout,
                tally.total,
                batch.len()
            )),
            Some(Interruption::Cancelled) => BatchEvent::Cancel(format!(
                "{CANCELLED_BY_CALLER} after {} of {} items completed",
                tally.total,
                batch.len()
            )),
            None => match executor.failure_policy().evaluate(&tally) {
                Verdict::Pass => BatchEvent::Complete,
                Verdict::Breach { cause } => BatchEvent::Fail(cause),
            },
        };

        let (status, cause) = {
            let mut state = state.write();
            if let Err(e) = state.transition(event) {
                // Cancelled by the caller while items were still running
                debug!(error = %e, "keeping earlier terminal status");
            }
            (state.status(), state.cause().map(str::to_string))
        };

        let result = BatchResult {
            execution_id: batch.execution_id,
            strategy: batch.strategy.kind(),
            status,
            cause,
            submitted_count: batch.len(),
            total_count: tally.total,
            success_count: tally.succeeded,
            failure_count: tally.failed,
            failure_percentage: tally.failure_percentage(),
            items: outcome.items,
            started_at,
            ended_at: Utc::now(),
        };

        info!(
            status = %result.status,
            total_count = result.total_count,
            failure_count = result.failure_count,
            "batch finished"
        );
        self.emit(&result).await;
        result
    }

    async fn emit(&self, result: &BatchResult) {
        let record = ExecutionRecord::from_result(result);
        for sink in self.sinks.iter() {
            if let Err(e) = sink.record(&record).await {
                warn!(sink = sink.name(), error = %e, "failed to emit execution record");
            }
        }
    }
}

impl std::fmt::Debug for ExecutionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCoordinator")
            .field("config", &self.config)
            .field("sinks", &self.sinks.len())
            .field("executions", &self.executions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{DistributedConfig, InlineConfig};
    use crate::observability::MemoryRecordSink;
    use crate::reliability::RetryPolicy;
    use crate::testing::{numbered_items, ScriptedWorker};

    fn coordinator(worker: ScriptedWorker) -> (ExecutionCoordinator, MemoryRecordSink) {
        let sink = MemoryRecordSink::new();
        let coordinator =
            ExecutionCoordinator::new(Arc::new(worker)).with_sink(Arc::new(sink.clone()));
        (coordinator, sink)
    }

    #[tokio::test]
    async fn test_submit_emits_one_record() {
        let (coordinator, sink) = coordinator(ScriptedWorker::new());

        let result = coordinator
            .submit(numbered_items(4), StrategyConfig::inline())
            .await
            .unwrap();

        assert_eq!(result.status, BatchStatus::Completed);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].execution_id, result.execution_id);
        assert_eq!(records[0].success_count, 4);
    }

    #[tokio::test]
    async fn test_validation_rejected_before_tracking() {
        let (coordinator, sink) = coordinator(ScriptedWorker::new());

        let err = coordinator
            .start(numbered_items(2), StrategyConfig::distributed(0, 10.0))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = coordinator
            .start_with_timeout(numbered_items(2), StrategyConfig::inline(), Duration::ZERO)
            .unwrap_err();
        assert_eq!(err, EngineError::Validation(ValidationError::ZeroBatchTimeout));

        assert_eq!(coordinator.execution_count(), 0);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_zero_item_timeout_rejected() {
        let coordinator = ExecutionCoordinator::with_config(
            Arc::new(ScriptedWorker::new()),
            EngineConfig::default().with_item_timeout(Duration::ZERO),
        );
        let err = coordinator
            .start(numbered_items(1), StrategyConfig::inline())
            .unwrap_err();
        assert_eq!(err, EngineError::Validation(ValidationError::ZeroItemTimeout));
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let (coordinator, _) = coordinator(ScriptedWorker::new());
        let id = Uuid::now_v7();

        let not_found = EngineError::ExecutionNotFound(id);

        assert_eq!(coordinator.poll(id).unwrap_err(), not_found);
        assert_eq!(coordinator.cancel(id).unwrap_err(), not_found);
        assert_eq!(coordinator.wait(id).await.unwrap_err(), not_found);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_then_wait() {
        let (coordinator, _) =
            coordinator(ScriptedWorker::new().with_delay(Duration::from_millis(100)));

        let id = coordinator
            .start(numbered_items(3), StrategyConfig::inline())
            .unwrap();
        let snapshot = coordinator.poll(id).unwrap();
        assert!(!snapshot.status.is_terminal());
        assert_eq!(snapshot.submitted_count, 3);
        assert!(snapshot.record.is_none());
        assert_eq!(
            coordinator.result(id).unwrap_err(),
            EngineError::ResultUnavailable(id)
        );

        let result = coordinator.wait(id).await.unwrap();
        assert_eq!(result.status, BatchStatus::Completed);

        let snapshot = coordinator.poll(id).unwrap();
        assert_eq!(snapshot.status, BatchStatus::Completed);
        assert_eq!(snapshot.record.unwrap().total_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_finished_execution_rejected() {
        let (coordinator, _) = coordinator(ScriptedWorker::new());
        let id = coordinator
            .start(numbered_items(1), StrategyConfig::inline())
            .unwrap();
        coordinator.wait(id).await.unwrap();

        let err = coordinator.cancel(id).unwrap_err();
        assert_eq!(
            err,
            EngineError::AlreadyFinished {
                execution_id: id,
                status: BatchStatus::Completed,
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (coordinator, _) = coordinator(ScriptedWorker::new());

        // Spawned task has not run yet on the current-thread runtime
        let id = coordinator
            .start(numbered_items(5), StrategyConfig::inline())
            .unwrap();
        assert_eq!(coordinator.cancel(id).unwrap(), BatchStatus::Cancelled);

        let result = coordinator.wait(id).await.unwrap();
        assert_eq!(result.status, BatchStatus::Cancelled);
        assert_eq!(result.total_count, 0);
        assert_eq!(result.submitted_count, 5);
        assert_eq!(result.cause.as_deref(), Some("cancelled by caller"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_only_finished() {
        let (coordinator, _) =
            coordinator(ScriptedWorker::new().with_delay(Duration::from_millis(100)));
        let id = coordinator
            .start(numbered_items(2), StrategyConfig::inline())
            .unwrap();
        assert_eq!(
            coordinator.remove(id).unwrap_err(),
            EngineError::ResultUnavailable(id)
        );

        let result = coordinator.wait(id).await.unwrap();
        let removed = coordinator.remove(id).unwrap();
        assert_eq!(removed, result);
        assert_eq!(coordinator.execution_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_does_not_retain_executions() {
        let (coordinator, sink) = coordinator(ScriptedWorker::new());

        for _ in 0..50 {
            coordinator
                .submit(numbered_items(10), StrategyConfig::inline())
                .await
                .unwrap();
        }

        assert_eq!(coordinator.execution_count(), 0);
        assert_eq!(sink.records().len(), 50);
    }

    #[tokio::test]
    async fn test_finished_executions_bounded() {
        let coordinator = ExecutionCoordinator::with_config(
            Arc::new(ScriptedWorker::new()),
            EngineConfig::default().with_finished_retention(2),
        );

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = coordinator
                .start(numbered_items(1), StrategyConfig::inline())
                .unwrap();
            coordinator.wait(id).await.unwrap();
            ids.push(id);
        }

        assert_eq!(coordinator.execution_count(), 2);
        assert_eq!(
            coordinator.poll(ids[0]).unwrap_err(),
            EngineError::ExecutionNotFound(ids[0])
        );
        assert_eq!(coordinator.poll(ids[4]).unwrap().status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_submit_kind_uses_configured_strategy() {
        // 3 of 10 failing only passes with the configured 50% tolerance
        let coordinator = ExecutionCoordinator::with_config(
            Arc::new(ScriptedWorker::new().fail_items(["item-1", "item-2", "item-3"])),
            EngineConfig::default().with_distributed(DistributedConfig::new(2, 50.0)),
        );

        let result = coordinator
            .submit_kind(numbered_items(10), StrategyKind::Distributed)
            .await
            .unwrap();

        assert_eq!(result.strategy, StrategyKind::Distributed);
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.failure_count, 3);
    }

    #[tokio::test]
    async fn test_start_kind_uses_configured_inline_retry() {
        let worker = Arc::new(ScriptedWorker::new().transient_failures("item-1", 1));
        let inline = InlineConfig::default().with_retry(
            RetryPolicy::exponential().with_initial_interval(Duration::from_millis(1)),
        );
        let coordinator = ExecutionCoordinator::with_config(
            worker.clone(),
            EngineConfig::default().with_inline(inline),
        );

        let id = coordinator
            .start_kind(numbered_items(2), StrategyKind::Inline)
            .unwrap();
        let result = coordinator.wait(id).await.unwrap();

        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(worker.calls("item-1"), 2);
    }

    #[tokio::test]
    async fn test_per_batch_timeout_override() {
        let (coordinator, _) = coordinator(ScriptedWorker::new());
        let result = coordinator
            .submit_with_timeout(
                numbered_items(2),
                StrategyConfig::distributed(2, 0.0),
                Duration::from_secs(900),
            )
            .await
            .unwrap();
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.strategy, StrategyKind::Distributed);
    }
}
