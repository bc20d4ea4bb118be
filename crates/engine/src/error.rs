//! Engine errors

use uuid::Uuid;

use crate::batch::ValidationError;
use crate::state::{BatchStatus, TransitionError};

/// Errors returned by the execution coordinator
///
/// Item failures never show up here: they are data inside the batch result.
/// Batch timeouts and cancellations are terminal statuses, not errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Strategy or batch parameters rejected before any item ran
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// No execution with this id is tracked
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Lifecycle guard rejected an event
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The execution already reached a terminal status
    #[error("execution {execution_id} already finished with status {status}")]
    AlreadyFinished {
        execution_id: Uuid,
        status: BatchStatus,
    },

    /// The execution has not finished yet
    #[error("execution {0} has not finished")]
    ResultUnavailable(Uuid),

    /// The execution task went away without publishing a result
    #[error("execution {0} stopped without a result")]
    Abandoned(Uuid),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
