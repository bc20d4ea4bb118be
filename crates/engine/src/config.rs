//! Engine configuration

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::{DistributedConfig, InlineConfig, StrategyConfig, StrategyKind};
use crate::reliability::duration_millis;
use crate::worker::DEFAULT_ITEM_TIMEOUT;

/// Default ceiling for a whole batch
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default number of finished executions kept for `poll` and `result`
pub const DEFAULT_FINISHED_RETENTION: usize = 1000;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Engine-wide defaults
///
/// Strategy configs here are what a batch submitted by [`StrategyKind`]
/// runs with; callers can always pass a full [`StrategyConfig`] instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard limit for one worker call
    #[serde(with = "duration_millis")]
    pub item_timeout: Duration,

    /// Ceiling for a whole batch
    #[serde(with = "duration_millis")]
    pub batch_timeout: Duration,

    pub inline: InlineConfig,

    pub distributed: DistributedConfig,

    /// Finished executions kept before the oldest are evicted
    #[serde(default = "default_finished_retention")]
    pub finished_retention: usize,
}

fn default_finished_retention() -> usize {
    DEFAULT_FINISHED_RETENTION
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            item_timeout: DEFAULT_ITEM_TIMEOUT,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            inline: InlineConfig::default(),
            distributed: DistributedConfig::default(),
            finished_retention: DEFAULT_FINISHED_RETENTION,
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - `MAPFLOW_ITEM_TIMEOUT_MS`: per-call worker timeout (default: 30000)
    /// - `MAPFLOW_BATCH_TIMEOUT_MS`: batch ceiling (default: 1800000)
    /// - `MAPFLOW_MAX_ATTEMPTS`: inline retry attempts, including the first (default: 3)
    /// - `MAPFLOW_RETRY_INITIAL_MS`: first retry delay (default: 1000)
    /// - `MAPFLOW_RETRY_MAX_MS`: retry delay cap (default: 30000)
    /// - `MAPFLOW_INLINE_MAX_CONCURRENCY`: inline concurrency (default: 1)
    /// - `MAPFLOW_DISTRIBUTED_MAX_CONCURRENCY`: distributed pool size (default: 10)
    /// - `MAPFLOW_TOLERATED_FAILURE_PERCENTAGE`: distributed tolerance (default: 20)
    /// - `MAPFLOW_FINISHED_RETENTION`: finished executions kept (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "MAPFLOW_ITEM_TIMEOUT_MS")? {
            config.item_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MAPFLOW_BATCH_TIMEOUT_MS")? {
            config.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, "MAPFLOW_MAX_ATTEMPTS")? {
            config.inline.retry.max_attempts = attempts;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MAPFLOW_RETRY_INITIAL_MS")? {
            config.inline.retry.initial_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "MAPFLOW_RETRY_MAX_MS")? {
            config.inline.retry.max_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MAPFLOW_INLINE_MAX_CONCURRENCY")? {
            config.inline.max_concurrency = n;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MAPFLOW_DISTRIBUTED_MAX_CONCURRENCY")? {
            config.distributed.max_concurrency = n;
        }
        if let Some(pct) = parse_var::<f64>(&lookup, "MAPFLOW_TOLERATED_FAILURE_PERCENTAGE")? {
            config.distributed.tolerated_failure_percentage = pct;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MAPFLOW_FINISHED_RETENTION")? {
            config.finished_retention = n;
        }

        Ok(config)
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn with_inline(mut self, inline: InlineConfig) -> Self {
        self.inline = inline;
        self
    }

    pub fn with_distributed(mut self, distributed: DistributedConfig) -> Self {
        self.distributed = distributed;
        self
    }

    pub fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention;
        self
    }

    /// Configured strategy for a kind
    pub fn strategy(&self, kind: StrategyKind) -> StrategyConfig {
        match kind {
            StrategyKind::Inline => StrategyConfig::Inline(self.inline.clone()),
            StrategyKind::Distributed => StrategyConfig::Distributed(self.distributed.clone()),
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.item_timeout, Duration::from_secs(30));
        assert_eq!(config.batch_timeout, Duration::from_secs(1800));
        assert_eq!(config.inline.max_concurrency, 1);
        assert_eq!(config.distributed.max_concurrency, 10);
        assert_eq!(config.distributed.tolerated_failure_percentage, 20.0);
        assert_eq!(config.finished_retention, 1000);
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let config = EngineConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("MAPFLOW_ITEM_TIMEOUT_MS", "5000"),
            ("MAPFLOW_BATCH_TIMEOUT_MS", "900000"),
            ("MAPFLOW_MAX_ATTEMPTS", "5"),
            ("MAPFLOW_RETRY_INITIAL_MS", "200"),
            ("MAPFLOW_RETRY_MAX_MS", "2000"),
            ("MAPFLOW_INLINE_MAX_CONCURRENCY", "4"),
            ("MAPFLOW_DISTRIBUTED_MAX_CONCURRENCY", " 5 "),
            ("MAPFLOW_TOLERATED_FAILURE_PERCENTAGE", "10"),
            ("MAPFLOW_FINISHED_RETENTION", "50"),
        ]))
        .unwrap();

        assert_eq!(config.item_timeout, Duration::from_secs(5));
        assert_eq!(config.batch_timeout, Duration::from_secs(900));
        assert_eq!(config.inline.retry.max_attempts, 5);
        assert_eq!(config.inline.retry.initial_interval, Duration::from_millis(200));
        assert_eq!(config.inline.retry.max_interval, Duration::from_secs(2));
        assert_eq!(config.inline.max_concurrency, 4);
        assert_eq!(config.distributed.max_concurrency, 5);
        assert_eq!(config.distributed.tolerated_failure_percentage, 10.0);
        assert_eq!(config.finished_retention, 50);
    }

    #[test]
    fn test_malformed_value() {
        let err = EngineConfig::from_lookup(lookup_from(&[(
            "MAPFLOW_DISTRIBUTED_MAX_CONCURRENCY",
            "many",
        )]))
        .unwrap_err();

        let ConfigError::InvalidValue { name, value, .. } = err;
        assert_eq!(name, "MAPFLOW_DISTRIBUTED_MAX_CONCURRENCY");
        assert_eq!(value, "many");
    }

    #[test]
    fn test_strategy_for_kind() {
        let config = EngineConfig::default();
        assert_eq!(
            config.strategy(StrategyKind::Distributed).kind(),
            StrategyKind::Distributed
        );
        assert_eq!(config.strategy(StrategyKind::Inline), StrategyConfig::inline());
    }

    #[test]
    fn test_serde_millis() {
        let json = serde_json::to_value(EngineConfig::default()).unwrap();
        assert_eq!(json["item_timeout"], 30_000);
        assert_eq!(json["batch_timeout"], 1_800_000);
    }
}
