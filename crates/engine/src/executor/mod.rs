//! Map executors
//!
//! Both strategies implement [`MapExecutor`]: they run items through the
//! worker and hand back the per-item results. Pass/fail is decided afterwards
//! by the strategy's [`FailurePolicy`], so the executors never judge a batch.

mod distributed;
mod inline;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::batch::{StrategyConfig, StrategyKind};
use crate::item::{Item, ItemResult};
use crate::policy::{FailurePolicy, Tally};
use crate::reliability::Deadline;
use crate::worker::WorkerInvoker;

pub use distributed::DistributedExecutor;
pub use inline::InlineExecutor;

/// Deadline and cancellation signal shared by one batch run
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    deadline: Deadline,
    cancel: CancellationToken,
}

impl ExecutionControl {
    /// Start the batch clock now
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Deadline::after(timeout),
            cancel,
        }
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Why a run stopped before every item finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    TimedOut,
    Cancelled,
}

/// Results gathered by one run
#[derive(Debug, Clone, PartialEq)]
pub struct MapOutcome {
    /// Completed items in input order
    pub items: Vec<ItemResult>,
    pub interruption: Option<Interruption>,
}

impl MapOutcome {
    pub fn tally(&self) -> Tally {
        Tally::from_results(&self.items)
    }
}

/// A map strategy
#[async_trait]
pub trait MapExecutor: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Policy that judges this executor's results
    fn failure_policy(&self) -> FailurePolicy;

    /// Process `items`, stopping early on the deadline or cancellation
    async fn run(&self, items: &[Item], control: &ExecutionControl) -> MapOutcome;
}

/// Build the executor for a strategy
pub fn executor_for(strategy: &StrategyConfig, invoker: WorkerInvoker) -> Box<dyn MapExecutor> {
    match strategy {
        StrategyConfig::Inline(config) => Box::new(InlineExecutor::new(config.clone(), invoker)),
        StrategyConfig::Distributed(config) => {
            Box::new(DistributedExecutor::new(config.clone(), invoker))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedWorker;
    use std::sync::Arc;

    #[test]
    fn test_executor_selection() {
        let invoker = WorkerInvoker::new(Arc::new(ScriptedWorker::new()));

        let inline = executor_for(&StrategyConfig::inline(), invoker.clone());
        assert_eq!(inline.kind(), StrategyKind::Inline);
        assert_eq!(inline.failure_policy(), FailurePolicy::ZeroTolerance);

        let distributed = executor_for(&StrategyConfig::distributed(5, 10.0), invoker);
        assert_eq!(distributed.kind(), StrategyKind::Distributed);
        assert_eq!(
            distributed.failure_policy(),
            FailurePolicy::ToleratedPercentage(10.0)
        );
    }
}
