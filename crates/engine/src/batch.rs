//! Batches and strategy configuration

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::{Item, ItemResult};
use crate::policy::{FailurePolicy, Tally};
use crate::reliability::RetryPolicy;
use crate::state::BatchStatus;

/// Map strategy discriminant, used in records and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Inline,
    Distributed,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline => write!(f, "inline"),
            Self::Distributed => write!(f, "distributed"),
        }
    }
}

/// Strict, order-preserving strategy
///
/// Every item runs through the retry policy; a single failure fails the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineConfig {
    /// In-process concurrency, 1 means strictly sequential
    pub max_concurrency: usize,

    /// Retry policy applied to every item
    pub retry: RetryPolicy,
}

impl Default for InlineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl InlineConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Tolerant, chunked strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Worker pool size, also the cap on concurrently running chunks
    pub max_concurrency: usize,

    /// Failure percentage the batch absorbs before it is marked failed
    pub tolerated_failure_percentage: f64,

    /// Fixed chunk size; when unset items are spread over `max_concurrency` chunks
    #[serde(default)]
    pub max_items_per_chunk: Option<usize>,

    /// Optional per-item retry, off by default
    #[serde(default)]
    pub item_retry: Option<RetryPolicy>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            tolerated_failure_percentage: 20.0,
            max_items_per_chunk: None,
            item_retry: None,
        }
    }
}

impl DistributedConfig {
    pub fn new(max_concurrency: usize, tolerated_failure_percentage: f64) -> Self {
        Self {
            max_concurrency,
            tolerated_failure_percentage,
            ..Default::default()
        }
    }

    pub fn with_max_items_per_chunk(mut self, size: usize) -> Self {
        self.max_items_per_chunk = Some(size);
        self
    }

    pub fn with_item_retry(mut self, retry: RetryPolicy) -> Self {
        self.item_retry = Some(retry);
        self
    }

    /// Items per chunk for a batch of `total` items
    pub fn chunk_size(&self, total: usize) -> usize {
        match self.max_items_per_chunk {
            Some(size) => size.max(1),
            None => total.div_ceil(self.max_concurrency.max(1)).max(1),
        }
    }
}

/// Strategy selection with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum StrategyConfig {
    Inline(InlineConfig),
    Distributed(DistributedConfig),
}

impl StrategyConfig {
    /// Inline strategy with defaults
    pub fn inline() -> Self {
        Self::Inline(InlineConfig::default())
    }

    /// Distributed strategy with the given pool size and tolerance
    pub fn distributed(max_concurrency: usize, tolerated_failure_percentage: f64) -> Self {
        Self::Distributed(DistributedConfig::new(
            max_concurrency,
            tolerated_failure_percentage,
        ))
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Inline(_) => StrategyKind::Inline,
            Self::Distributed(_) => StrategyKind::Distributed,
        }
    }

    /// The pass/fail policy this strategy applies
    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            Self::Inline(_) => FailurePolicy::ZeroTolerance,
            Self::Distributed(config) => {
                FailurePolicy::ToleratedPercentage(config.tolerated_failure_percentage)
            }
        }
    }

    /// Validate parameters before any item runs
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Inline(config) => {
                if config.max_concurrency == 0 {
                    return Err(ValidationError::InvalidMaxConcurrency(0));
                }
                validate_retry(&config.retry)
            }
            Self::Distributed(config) => {
                if config.max_concurrency == 0 {
                    return Err(ValidationError::InvalidMaxConcurrency(0));
                }
                let pct = config.tolerated_failure_percentage;
                if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
                    return Err(ValidationError::InvalidToleratedFailurePercentage(pct));
                }
                if config.max_items_per_chunk == Some(0) {
                    return Err(ValidationError::InvalidChunkSize);
                }
                match &config.item_retry {
                    Some(retry) => validate_retry(retry),
                    None => Ok(()),
                }
            }
        }
    }
}

fn validate_retry(retry: &RetryPolicy) -> Result<(), ValidationError> {
    if retry.max_attempts == 0 {
        return Err(ValidationError::InvalidMaxAttempts);
    }
    if !retry.backoff_coefficient.is_finite() || retry.backoff_coefficient < 1.0 {
        return Err(ValidationError::InvalidBackoffCoefficient(
            retry.backoff_coefficient,
        ));
    }
    Ok(())
}

/// Strategy or batch parameters rejected before execution
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("max_concurrency must be at least 1, got {0}")]
    InvalidMaxConcurrency(usize),

    #[error("tolerated_failure_percentage must be within 0..=100, got {0}")]
    InvalidToleratedFailurePercentage(f64),

    #[error("max_items_per_chunk must be at least 1")]
    InvalidChunkSize,

    #[error("retry max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("retry backoff_coefficient must be >= 1.0, got {0}")]
    InvalidBackoffCoefficient(f64),

    #[error("batch timeout must be greater than zero")]
    ZeroBatchTimeout,

    #[error("item timeout must be greater than zero")]
    ZeroItemTimeout,
}

/// A submitted batch
///
/// Created by the coordinator when items are accepted; never mutated
/// afterwards.
#[derive(Debug, Clone)]
pub struct Batch {
    pub execution_id: Uuid,
    pub items: Vec<Item>,
    pub strategy: StrategyConfig,
    pub timeout: Duration,
}

impl Batch {
    pub fn new(items: Vec<Item>, strategy: StrategyConfig, timeout: Duration) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            items,
            strategy,
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Final result of a batch execution
///
/// `total_count` counts completed items only; on a timeout or cancellation it
/// can be smaller than `submitted_count`. Items appear in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub execution_id: Uuid,
    pub strategy: StrategyKind,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub submitted_count: usize,
    pub total_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub failure_percentage: f64,
    pub items: Vec<ItemResult>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl BatchResult {
    pub fn tally(&self) -> Tally {
        Tally {
            total: self.total_count,
            succeeded: self.success_count,
            failed: self.failure_count,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0) as u64
    }
}
