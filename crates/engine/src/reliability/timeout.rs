//! Batch deadline tracking

use std::time::Duration;

use tokio::time::Instant;

/// A wall-clock deadline for a batch
///
/// Built from the batch timeout when execution starts. Executors race their
/// work against [`Deadline::expired`]; in-flight invocations that lose the
/// race are dropped rather than interrupted inside the worker.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started_at: Instant,
    limit: Duration,
}

impl Deadline {
    /// Start a deadline `limit` from now
    pub fn after(limit: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            limit,
        }
    }

    /// The configured limit
    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// The instant the deadline fires
    pub fn instant(&self) -> Instant {
        self.started_at + self.limit
    }

    /// Time left before the deadline, `None` once it has passed
    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .checked_sub(self.started_at.elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_none()
    }

    /// Resolves when the deadline fires
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.instant()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_time() {
        let deadline = Deadline::after(Duration::from_secs(60));
        tokio::time::advance(Duration::from_secs(10)).await;

        let remaining = deadline.remaining().unwrap();
        assert_eq!(remaining, Duration::from_secs(50));
        assert!(!deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_time_expired() {
        let deadline = Deadline::after(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(deadline.remaining().is_none());
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_future_fires_at_limit() {
        let deadline = Deadline::after(Duration::from_millis(250));
        let start = Instant::now();
        deadline.expired().await;
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        assert_eq!(deadline.limit(), Duration::from_millis(250));
    }
}
