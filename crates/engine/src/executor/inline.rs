//! Inline strategy: strict, order-preserving map

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{ExecutionControl, Interruption, MapExecutor, MapOutcome};
use crate::batch::{InlineConfig, StrategyKind};
use crate::item::{Item, ItemResult};
use crate::policy::FailurePolicy;
use crate::reliability::{with_retry, RetryPolicy};
use crate::worker::WorkerInvoker;

/// One item's run, tagged with its input position; `None` if it was never
/// dispatched
type IndexedRun = BoxFuture<'static, Option<(usize, ItemResult)>>;

/// Runs items in process with bounded concurrency
///
/// Every finished result is kept in its input slot, so a deadline never
/// drops work that already completed. A failed item does not stop the run;
/// every item is attempted so the full result set is visible.
pub struct InlineExecutor {
    config: InlineConfig,
    invoker: WorkerInvoker,
}

impl InlineExecutor {
    pub fn new(config: InlineConfig, invoker: WorkerInvoker) -> Self {
        Self { config, invoker }
    }

    fn runs(&self, items: &[Item], cancel: &CancellationToken) -> Vec<IndexedRun> {
        items
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, item)| {
                let invoker = self.invoker.clone();
                let retry = self.config.retry.clone();
                let cancel = cancel.clone();
                async move {
                    // First poll is dispatch; cancelled items never start
                    if cancel.is_cancelled() {
                        return None;
                    }
                    Some((index, process(&invoker, &retry, &item).await))
                }
                .boxed()
            })
            .collect()
    }

    #[instrument(
        skip_all,
        fields(items = items.len(), max_concurrency = self.config.max_concurrency)
    )]
    async fn map_items(&self, items: &[Item], control: &ExecutionControl) -> MapOutcome {
        let cancel = control.cancel_token();
        let mut finished = stream::iter(self.runs(items, cancel))
            .buffer_unordered(self.config.max_concurrency.max(1));

        let expired = control.deadline().expired();
        tokio::pin!(expired);

        let mut slots: Vec<Option<ItemResult>> = vec![None; items.len()];
        let mut timed_out = false;
        loop {
            tokio::select! {
                biased;
                _ = &mut expired => {
                    timed_out = true;
                    break;
                }
                next = finished.next() => match next {
                    Some(Some((index, result))) => slots[index] = Some(result),
                    Some(None) => {}
                    None => break,
                },
            }
        }

        let collected: Vec<ItemResult> = slots.into_iter().flatten().collect();

        let interruption = if timed_out {
            warn!(
                completed = collected.len(),
                total = items.len(),
                "inline run hit the batch deadline"
            );
            Some(Interruption::TimedOut)
        } else if collected.len() < items.len() && cancel.is_cancelled() {
            debug!(completed = collected.len(), "inline run cancelled");
            Some(Interruption::Cancelled)
        } else {
            None
        };

        MapOutcome {
            items: collected,
            interruption,
        }
    }
}

async fn process(invoker: &WorkerInvoker, retry: &RetryPolicy, item: &Item) -> ItemResult {
    let retried = with_retry(retry, || invoker.invoke(item)).await;
    if retried.attempts > 1 {
        debug!(
            item_id = %item.item_id,
            attempts = retried.attempts,
            success = retried.result.is_success(),
            "item finished after retries"
        );
    }
    retried.result
}

#[async_trait]
impl MapExecutor for InlineExecutor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Inline
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::ZeroTolerance
    }

    async fn run(&self, items: &[Item], control: &ExecutionControl) -> MapOutcome {
        self.map_items(items, control).await
    }
}
