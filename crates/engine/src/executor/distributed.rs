//! Distributed strategy: chunked worker pool with tolerated failures

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{ExecutionControl, Interruption, MapExecutor, MapOutcome};
use crate::batch::{DistributedConfig, StrategyKind};
use crate::item::{Item, ItemResult};
use crate::policy::FailurePolicy;
use crate::reliability::{with_retry, RetryPolicy};
use crate::worker::WorkerInvoker;

/// Results of one chunk; only that chunk's task writes to it
type ChunkBuffer = Arc<Mutex<Vec<ItemResult>>>;

/// Splits items into chunks and runs them on a pool of `max_concurrency`
/// workers
///
/// Chunks are dispatched in index order. Each chunk processes its items
/// sequentially into its own buffer, and the buffers are merged in index
/// order once the run ends, so results keep input order even though chunks
/// finish in any order.
pub struct DistributedExecutor {
    config: DistributedConfig,
    invoker: WorkerInvoker,
}

impl DistributedExecutor {
    pub fn new(config: DistributedConfig, invoker: WorkerInvoker) -> Self {
        Self { config, invoker }
    }

    async fn dispatch(
        &self,
        chunks: Vec<Vec<Item>>,
        buffers: &[ChunkBuffer],
        tasks: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        for (index, chunk) in chunks.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(next_chunk = index, "dispatch stopped by cancellation");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let invoker = self.invoker.clone();
            let retry = self.config.item_retry.clone();
            let buffer = buffers[index].clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                run_chunk(index, chunk, &invoker, retry.as_ref(), &cancel, &buffer).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "chunk task ended abnormally");
            }
        }
    }

    #[instrument(
        skip_all,
        fields(items = items.len(), max_concurrency = self.config.max_concurrency)
    )]
    async fn map_items(&self, items: &[Item], control: &ExecutionControl) -> MapOutcome {
        let chunk_size = self.config.chunk_size(items.len());
        let chunks: Vec<Vec<Item>> = items.chunks(chunk_size).map(<[Item]>::to_vec).collect();
        let buffers: Vec<ChunkBuffer> = chunks
            .iter()
            .map(|chunk| Arc::new(Mutex::new(Vec::with_capacity(chunk.len()))))
            .collect();

        info!(chunks = chunks.len(), chunk_size, "dispatching chunks");

        let cancel = control.cancel_token();
        let mut tasks = JoinSet::new();
        let timed_out = {
            let dispatch = self.dispatch(chunks, &buffers, &mut tasks, cancel);
            tokio::select! {
                biased;
                _ = control.deadline().expired() => true,
                _ = dispatch => false,
            }
        };

        if timed_out {
            // Stop running chunks; whatever they finished stays in their buffers
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let collected: Vec<ItemResult> = buffers
            .iter()
            .flat_map(|buffer| std::mem::take(&mut *buffer.lock()))
            .collect();

        let interruption = if timed_out {
            warn!(
                completed = collected.len(),
                total = items.len(),
                "distributed run hit the batch deadline"
            );
            Some(Interruption::TimedOut)
        } else if collected.len() < items.len() && cancel.is_cancelled() {
            debug!(completed = collected.len(), "distributed run cancelled");
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

async fn run_chunk(
    index: usize,
    chunk: Vec<Item>,
    invoker: &WorkerInvoker,
    retry: Option<&RetryPolicy>,
    cancel: &CancellationToken,
    buffer: &Mutex<Vec<ItemResult>>,
) {
    debug!(chunk = index, items = chunk.len(), "chunk started");

    for item in &chunk {
        if cancel.is_cancelled() {
            debug!(chunk = index, "chunk stopped by cancellation");
            return;
        }
        let result = match retry {
            Some(policy) => with_retry(policy, || invoker.invoke(item)).await.result,
            None => invoker.invoke(item).await,
        };
        buffer.lock().push(result);
    }

    debug!(chunk = index, "chunk finished");
}

#[async_trait]
impl MapExecutor for DistributedExecutor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Distributed
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::ToleratedPercentage(self.config.tolerated_failure_percentage)
    }

    async fn run(&self, items: &[Item], control: &ExecutionControl) -> MapOutcome {
        self.map_items(items, control).await
    }
}
