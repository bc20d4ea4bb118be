//! Retry policy implementation

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::item::{ErrorKind, ItemResult};

/// Configuration for item retries
///
/// Retries only failures whose kind is listed in `retryable_error_kinds`.
/// By default that is the transient service kinds, never business failures.
///
/// # Example
///
/// ```
/// use mapflow_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_millis(500))
///     .with_max_interval(Duration::from_secs(5));
///
/// // First retry after 500ms, then 1s, then 2s
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
/// assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Cap on the delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0), 0.1 means ±10%
    pub jitter: f64,

    /// Failure kinds that are retried
    #[serde(default = "default_retryable_kinds")]
    pub retryable_error_kinds: Vec<ErrorKind>,
}

fn default_retryable_kinds() -> Vec<ErrorKind> {
    vec![ErrorKind::ServiceException, ErrorKind::TooManyRequests]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff policy
    ///
    /// - 3 max attempts
    /// - 1 second initial interval
    /// - 30 second max interval
    /// - 2x backoff coefficient
    /// - no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.0,
            retryable_error_kinds: default_retryable_kinds(),
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            retryable_error_kinds: vec![],
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay for a given attempt number (1-based)
    ///
    /// Returns the duration to wait before that attempt starts.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if a failure kind should be retried
    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        self.retryable_error_kinds.contains(&kind)
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Final result of a retried operation plus the attempts it took
///
/// `attempts` is the only place "failed after retries" differs from
/// "failed immediately".
#[derive(Debug, Clone, PartialEq)]
pub struct RetriedResult {
    pub result: ItemResult,
    pub attempts: u32,
}

/// Run `op` under `policy`
///
/// Every attempt produces an `ItemResult`; retryable failures are retried
/// after the policy's backoff until attempts run out, then the last result
/// is returned.
pub async fn with_retry<F, Fut>(policy: &RetryPolicy, mut op: F) -> RetriedResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ItemResult>,
{
    let mut attempt = 1;
    loop {
        let result = op().await;

        let retry = match result.error_kind() {
            Some(kind) => policy.should_retry(kind) && policy.has_attempts_remaining(attempt),
            None => false,
        };
        if !retry {
            return RetriedResult { result, attempts: attempt };
        }

        attempt += 1;
        let delay = policy.delay_for_attempt(attempt);
        debug!(
            item_id = %result.item_id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying item after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
