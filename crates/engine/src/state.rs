//! Batch lifecycle state machine
//!
//! ```text
//!                       ┌──────────► Completed
//!                       │
//! Pending ──Start──► Running ──────► Failed
//!    │                  │
//!    │                  ├──────────► TimedOut
//!    │                  │
//!    └──────Cancel──────┴──────────► Cancelled
//! ```
//!
//! Every terminal state is final. A batch that should run again needs a new
//! execution id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a batch execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Batch accepted, no item dispatched yet
    Pending,
    /// Items are being processed
    Running,
    /// All items processed and the failure policy passed
    Completed,
    /// All items processed and the failure policy was breached
    Failed,
    /// The batch deadline fired before all items finished
    TimedOut,
    /// The caller cancelled the batch
    Cancelled,
}

impl BatchStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid batch status: {s}")),
        }
    }
}

/// Events that drive batch transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "cause", rename_all = "snake_case")]
pub enum BatchEvent {
    Start,
    Complete,
    Fail(String),
    TimeOut(String),
    Cancel(String),
}

impl BatchEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::TimeOut(_) => "time_out",
            Self::Cancel(_) => "cancel",
        }
    }

    fn cause(&self) -> Option<&str> {
        match self {
            Self::Fail(cause) | Self::TimeOut(cause) | Self::Cancel(cause) => Some(cause),
            Self::Start | Self::Complete => None,
        }
    }
}

/// Rejected transition
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cannot apply {event} to batch {execution_id} in state {from}")]
pub struct TransitionError {
    pub execution_id: Uuid,
    pub from: BatchStatus,
    pub event: &'static str,
}

/// One applied transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: BatchStatus,
    pub to: BatchStatus,
    pub at: DateTime<Utc>,
}

/// Owned state machine for one batch
#[derive(Debug, Clone)]
pub struct BatchStateMachine {
    execution_id: Uuid,
    status: BatchStatus,
    cause: Option<String>,
    history: Vec<StateTransition>,
}

impl BatchStateMachine {
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            status: BatchStatus::Pending,
            cause: None,
            history: Vec::new(),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    /// Cause recorded by the terminal transition, if any
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Apply an event, returning the new status
    pub fn transition(&mut self, event: BatchEvent) -> Result<BatchStatus, TransitionError> {
        let target = Self::determine_target_state(self.status, &event).ok_or(TransitionError {
            execution_id: self.execution_id,
            from: self.status,
            event: event.event_type(),
        })?;

        self.history.push(StateTransition {
            from: self.status,
            to: target,
            at: Utc::now(),
        });
        if let Some(cause) = event.cause() {
            self.cause = Some(cause.to_string());
        }
        self.status = target;

        Ok(target)
    }

    fn determine_target_state(current: BatchStatus, event: &BatchEvent) -> Option<BatchStatus> {
        let target = match (current, event) {
            (BatchStatus::Pending, BatchEvent::Start) => BatchStatus::Running,

            (BatchStatus::Running, BatchEvent::Complete) => BatchStatus::Completed,
            (BatchStatus::Running, BatchEvent::Fail(_)) => BatchStatus::Failed,
            (BatchStatus::Running, BatchEvent::TimeOut(_)) => BatchStatus::TimedOut,

            // Cancellation short-circuits from any non-terminal state
            (BatchStatus::Pending | BatchStatus::Running, BatchEvent::Cancel(_)) => {
                BatchStatus::Cancelled
            }

            _ => return None,
        };
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_check() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::TimedOut.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(!BatchStatus::Pending.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
    }

    #[test]
    fn test_happy_path() {
        let mut sm = BatchStateMachine::new(Uuid::now_v7());
        assert_eq!(sm.status(), BatchStatus::Pending);

        assert_eq!(sm.transition(BatchEvent::Start).unwrap(), BatchStatus::Running);
        assert_eq!(sm.transition(BatchEvent::Complete).unwrap(), BatchStatus::Completed);
        assert_eq!(sm.history().len(), 2);
        assert!(sm.cause().is_none());
    }

    #[test]
    fn test_failure_records_cause() {
        let mut sm = BatchStateMachine::new(Uuid::now_v7());
        sm.transition(BatchEvent::Start).unwrap();
        sm.transition(BatchEvent::Fail("zero tolerance breached".into()))
            .unwrap();

        assert_eq!(sm.status(), BatchStatus::Failed);
        assert_eq!(sm.cause(), Some("zero tolerance breached"));
    }

    #[test]
    fn test_cancel_from_pending() {
        let mut sm = BatchStateMachine::new(Uuid::now_v7());
        assert_eq!(
            sm.transition(BatchEvent::Cancel("caller".into())).unwrap(),
            BatchStatus::Cancelled
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = BatchStateMachine::new(Uuid::now_v7());

        // Cannot complete before starting
        let err = sm.transition(BatchEvent::Complete).unwrap_err();
        assert_eq!(err.from, BatchStatus::Pending);
        assert_eq!(err.event, "complete");

        sm.transition(BatchEvent::Start).unwrap();
        sm.transition(BatchEvent::TimeOut("timed out".into())).unwrap();

        // Terminal states are final
        assert!(sm.transition(BatchEvent::Start).is_err());
        assert!(sm.transition(BatchEvent::Cancel("late".into())).is_err());
        assert!(sm.transition(BatchEvent::Complete).is_err());
        assert_eq!(sm.status(), BatchStatus::TimedOut);
        assert_eq!(sm.history().len(), 2);
    }

    #[test]
    fn test_status_string_conversion() {
        assert_eq!(BatchStatus::TimedOut.to_string(), "timed_out");
        assert_eq!("cancelled".parse::<BatchStatus>().unwrap(), BatchStatus::Cancelled);
        assert!("bogus".parse::<BatchStatus>().is_err());

        let json = serde_json::to_string(&BatchStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }
}
