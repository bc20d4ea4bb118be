//! # Mapflow Batch Map Engine
//!
//! A self-hosted engine that maps a worker function over a batch of items.
//!
//! ## Features
//!
//! - **Inline strategy**: bounded in-process concurrency, input-order results, zero failure tolerance
//! - **Distributed strategy**: chunked worker pool with a tolerated failure percentage
//! - **Automatic retries**: exponential backoff for transient failure kinds only
//! - **Deadlines and cancellation**: a batch timeout ceiling plus caller-initiated cancel
//! - **Execution records**: one structured record per finished batch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ExecutionCoordinator                       │
//! │  (validates, owns the state machine, emits records)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          InlineExecutor  |  DistributedExecutor              │
//! │  (MapExecutor + FailurePolicy, judged after the run)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              with_retry  →  WorkerInvoker                    │
//! │  (backoff on transient kinds, hard per-call timeout)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use mapflow_engine::prelude::*;
//!
//! let worker = worker_fn(|item| async move {
//!     Ok(json!({"itemId": item.item_id, "status": "processed"}))
//! });
//! let coordinator = ExecutionCoordinator::new(Arc::new(worker));
//!
//! let result = coordinator
//!     .submit(numbered_items(100), StrategyConfig::distributed(5, 10.0))
//!     .await?;
//! assert_eq!(result.status, BatchStatus::Completed);
//! ```

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod item;
pub mod observability;
pub mod policy;
pub mod reliability;
pub mod state;
pub mod testing;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::batch::{
        BatchResult, DistributedConfig, InlineConfig, StrategyConfig, StrategyKind,
        ValidationError,
    };
    pub use crate::config::EngineConfig;
    pub use crate::coordinator::{ExecutionCoordinator, ExecutionSnapshot};
    pub use crate::error::EngineError;
    pub use crate::item::{ErrorKind, Item, ItemResult};
    pub use crate::observability::{ExecutionRecord, ExecutionRecordSink};
    pub use crate::reliability::RetryPolicy;
    pub use crate::state::BatchStatus;
    pub use crate::worker::{worker_fn, ItemWorker, WorkerFailure};
}

// Re-export key types at crate root
pub use batch::{
    Batch, BatchResult, DistributedConfig, InlineConfig, StrategyConfig, StrategyKind,
    ValidationError,
};
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{ExecutionCoordinator, ExecutionSnapshot};
pub use error::EngineError;
pub use executor::{DistributedExecutor, ExecutionControl, InlineExecutor, MapExecutor};
pub use item::{items_from_json, ErrorKind, Item, ItemResult};
pub use observability::{
    init_tracing, ExecutionRecord, ExecutionRecordSink, MemoryRecordSink, TracingRecordSink,
};
pub use policy::{FailurePolicy, Tally, Verdict};
pub use reliability::{with_retry, Deadline, RetriedResult, RetryPolicy};
pub use state::{BatchEvent, BatchStateMachine, BatchStatus, TransitionError};
pub use worker::{worker_fn, ItemWorker, WorkerFailure, WorkerInvoker};
