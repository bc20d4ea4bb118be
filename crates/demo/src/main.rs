use std::sync::Arc;

use anyhow::Result;
use mapflow_engine::testing::{numbered_items, DemoWorker};
use mapflow_engine::{
    init_tracing, EngineConfig, ExecutionCoordinator, ExecutionRecord, MemoryRecordSink,
    StrategyKind,
};

const DEMO_ITEMS: usize = 100;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("mapflow_engine=info,mapflow_demo=info");

    tracing::info!("mapflow-demo starting...");

    let config = EngineConfig::from_env()?;
    tracing::info!(
        item_timeout_ms = config.item_timeout.as_millis() as u64,
        batch_timeout_ms = config.batch_timeout.as_millis() as u64,
        distributed_max_concurrency = config.distributed.max_concurrency,
        tolerated_failure_percentage = config.distributed.tolerated_failure_percentage,
        "Engine configured"
    );

    let sink = MemoryRecordSink::new();
    let coordinator = ExecutionCoordinator::with_config(Arc::new(DemoWorker::default()), config)
        .with_sink(Arc::new(sink.clone()));

    // Same worker, same items, two strategies
    for kind in [StrategyKind::Inline, StrategyKind::Distributed] {
        let result = coordinator
            .submit_kind(numbered_items(DEMO_ITEMS), kind)
            .await?;

        tracing::info!(
            strategy = %kind,
            status = %result.status,
            failure_count = result.failure_count,
            "Strategy finished"
        );
        println!(
            "{}",
            serde_json::to_string_pretty(&ExecutionRecord::from_result(&result))?
        );
    }

    tracing::info!(records = sink.records().len(), "mapflow-demo complete");
    Ok(())
}
