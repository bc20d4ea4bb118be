//! Workers and fixtures for exercising the engine
//!
//! [`ScriptedWorker`] is deterministic and records how it was called.
//! [`DemoWorker`] fails at random and backs the demo binary.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;

use crate::item::{ErrorKind, Item};
use crate::worker::{ItemWorker, WorkerFailure};

/// Deterministic worker driven by per-item rules
///
/// ```
/// use mapflow_engine::testing::ScriptedWorker;
/// use mapflow_engine::ErrorKind;
///
/// let worker = ScriptedWorker::new()
///     .fail_items(["item-5", "item-13"])
///     .fail_with(ErrorKind::WorkerError)
///     .transient_failures("item-2", 1);
/// assert_eq!(worker.total_calls(), 0);
/// ```
#[derive(Debug)]
pub struct ScriptedWorker {
    failing: HashSet<String>,
    failure_kind: ErrorKind,
    delay: Duration,
    item_delays: HashMap<String, Duration>,
    transient: DashMap<String, u32>,
    calls: DashMap<String, u32>,
    invocation_order: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedWorker {
    /// A worker that succeeds for every item immediately
    pub fn new() -> Self {
        Self {
            failing: HashSet::new(),
            failure_kind: ErrorKind::WorkerError,
            delay: Duration::ZERO,
            item_delays: HashMap::new(),
            transient: DashMap::new(),
            calls: DashMap::new(),
            invocation_order: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Fail these items on every call
    pub fn fail_items<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failing.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Kind reported for items listed in `fail_items`
    pub fn fail_with(mut self, kind: ErrorKind) -> Self {
        self.failure_kind = kind;
        self
    }

    /// Sleep this long in every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sleep this long when processing one item, overriding `with_delay`
    pub fn with_item_delay(mut self, id: impl Into<String>, delay: Duration) -> Self {
        self.item_delays.insert(id.into(), delay);
        self
    }

    /// Fail the first `count` calls for an item with `ServiceException`
    pub fn transient_failures(self, id: impl Into<String>, count: u32) -> Self {
        self.transient.insert(id.into(), count);
        self
    }

    /// Number of calls seen for an item
    pub fn calls(&self, id: &str) -> u32 {
        self.calls.get(id).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }

    /// Highest number of concurrent calls observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Item ids in the order calls started
    pub fn invocation_order(&self) -> Vec<String> {
        self.invocation_order.lock().clone()
    }

    fn scripted_outcome(&self, item: &Item) -> Result<serde_json::Value, WorkerFailure> {
        if let Some(mut remaining) = self.transient.get_mut(&item.item_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(WorkerFailure::service("service temporarily unavailable"));
            }
        }
        if self.failing.contains(&item.item_id) {
            return Err(WorkerFailure::with_kind(
                self.failure_kind,
                format!("scripted failure for {}", item.item_id),
            ));
        }
        Ok(json!({
            "itemId": item.item_id,
            "status": "processed",
            "input": item.payload,
        }))
    }
}

/// Decrements the in-flight gauge even when the call is dropped mid-way
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ItemWorker for ScriptedWorker {
    async fn process(&self, item: &Item) -> Result<serde_json::Value, WorkerFailure> {
        *self.calls.entry(item.item_id.clone()).or_insert(0) += 1;
        self.invocation_order.lock().push(item.item_id.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = self
            .item_delays
            .get(&item.item_id)
            .copied()
            .unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.scripted_outcome(item)
    }
}

/// Worker that fails a fixed share of calls at random
///
/// Successful calls return `{itemId, status, processedAt, processingTimeMs}`
/// after a short simulated latency.
#[derive(Debug, Clone)]
pub struct DemoWorker {
    failure_rate: f64,
    latency_ms: std::ops::Range<u64>,
}

impl Default for DemoWorker {
    fn default() -> Self {
        Self {
            failure_rate: 0.1,
            latency_ms: 50..150,
        }
    }
}

impl DemoWorker {
    /// Failure rate is clamped to 0.0-1.0
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            ..Default::default()
        }
    }

    pub fn with_latency(mut self, latency_ms: std::ops::Range<u64>) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

#[async_trait]
impl ItemWorker for DemoWorker {
    async fn process(&self, item: &Item) -> Result<serde_json::Value, WorkerFailure> {
        let (fail, latency) = {
            let mut rng = rand::thread_rng();
            let latency = if self.latency_ms.is_empty() {
                0
            } else {
                rng.gen_range(self.latency_ms.clone())
            };
            (rng.gen_bool(self.failure_rate), latency)
        };

        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if fail {
            return Err(WorkerFailure::worker("random processing error"));
        }

        Ok(json!({
            "itemId": item.item_id,
            "status": "processed",
            "processedAt": Utc::now().to_rfc3339(),
            "processingTimeMs": latency,
        }))
    }
}

/// `item-1` through `item-n`, each payload carrying its id and 1-based index
pub fn numbered_items(n: usize) -> Vec<Item> {
    (1..=n)
        .map(|i| {
            let id = format!("item-{i}");
            Item::new(id.clone(), json!({"itemId": id, "index": i}))
        })
        .collect()
}
