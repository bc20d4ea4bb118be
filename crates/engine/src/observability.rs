//! Execution records and tracing setup
//!
//! Every finished batch produces one [`ExecutionRecord`], handed to each
//! configured [`ExecutionRecordSink`]. A failing sink is logged and skipped;
//! it never changes the batch outcome.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::batch::{BatchResult, StrategyKind};
use crate::state::BatchStatus;

/// Environment variable selecting the log format (`json` or `text`)
pub const LOG_FORMAT_ENV: &str = "MAPFLOW_LOG_FORMAT";

/// Summary of one batch execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub strategy: StrategyKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub total_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub failure_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub submitted_count: usize,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn from_result(result: &BatchResult) -> Self {
        Self {
            execution_id: result.execution_id,
            strategy: result.strategy,
            started_at: result.started_at,
            ended_at: result.ended_at,
            status: result.status,
            total_count: result.total_count,
            success_count: result.success_count,
            failure_count: result.failure_count,
            failure_percentage: result.failure_percentage,
            cause: result.cause.clone(),
            submitted_count: result.submitted_count,
            duration_ms: result.duration_ms(),
        }
    }
}

/// Errors a sink may report
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for execution records
#[async_trait]
pub trait ExecutionRecordSink: Send + Sync {
    /// Get the name of this sink (for logging)
    fn name(&self) -> &'static str;

    async fn record(&self, record: &ExecutionRecord) -> Result<(), SinkError>;
}

/// Logs each record as a structured `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecordSink;

#[async_trait]
impl ExecutionRecordSink for TracingRecordSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn record(&self, record: &ExecutionRecord) -> Result<(), SinkError> {
        info!(
            execution_id = %record.execution_id,
            strategy = %record.strategy,
            status = %record.status,
            total_count = record.total_count,
            success_count = record.success_count,
            failure_count = record.failure_count,
            failure_percentage = record.failure_percentage,
            submitted_count = record.submitted_count,
            duration_ms = record.duration_ms,
            cause = record.cause.as_deref().unwrap_or(""),
            "batch execution finished"
        );
        Ok(())
    }
}

/// Keeps records in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordSink {
    records: Arc<Mutex<Vec<ExecutionRecord>>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().clone()
    }

    /// Records as JSON lines, in emission order
    pub fn to_json_lines(&self) -> Result<String, SinkError> {
        let records = self.records.lock();
        let mut out = String::new();
        for record in records.iter() {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[async_trait]
impl ExecutionRecordSink for MemoryRecordSink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn record(&self, record: &ExecutionRecord) -> Result<(), SinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `default_directive`. Output is JSON when
/// `MAPFLOW_LOG_FORMAT=json`. Returns `false` if a subscriber was already set.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_directive.into());
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .is_ok()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ErrorKind, ItemResult};
    use serde_json::json;

    fn sample_result() -> BatchResult {
        let started_at = Utc::now();
        BatchResult {
            execution_id: Uuid::now_v7(),
            strategy: StrategyKind::Distributed,
            status: BatchStatus::Completed,
            cause: None,
            submitted_count: 2,
            total_count: 2,
            success_count: 1,
            failure_count: 1,
            failure_percentage: 50.0,
            items: vec![
                ItemResult::success("a", json!({}), 3),
                ItemResult::failure("b", ErrorKind::WorkerError, "bad"),
            ],
            started_at,
            ended_at: started_at + chrono::Duration::milliseconds(1500),
        }
    }

    #[test]
    fn test_record_shape() {
        let record = ExecutionRecord::from_result(&sample_result());
        assert_eq!(record.duration_ms, 1500);

        let json = serde_json::to_value(&record).unwrap();
        for key in [
            "executionId",
            "strategy",
            "startedAt",
            "endedAt",
            "status",
            "totalCount",
            "successCount",
            "failureCount",
            "failurePercentage",
            "submittedCount",
            "durationMs",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
        assert_eq!(json["strategy"], "distributed");
        assert_eq!(json["status"], "completed");
        assert!(json.get("cause").is_none());
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemoryRecordSink::new();
        let record = ExecutionRecord::from_result(&sample_result());
        sink.record(&record).await.unwrap();
        sink.record(&record).await.unwrap();

        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.to_json_lines().unwrap().lines().count(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_tracing_sink_never_fails() {
        let record = ExecutionRecord::from_result(&sample_result());
        assert!(TracingRecordSink.record(&record).await.is_ok());
    }
}
