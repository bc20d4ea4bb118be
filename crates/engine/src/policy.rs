//! Batch pass/fail policies
//!
//! Both map strategies gather the same per-item results; they differ only in
//! which [`FailurePolicy`] judges them.

use serde::{Deserialize, Serialize};

use crate::item::ItemResult;

/// Counts over a set of item results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl Tally {
    pub fn from_results(results: &[ItemResult]) -> Self {
        let failed = results.iter().filter(|r| r.is_failure()).count();
        Self {
            total: results.len(),
            succeeded: results.len() - failed,
            failed,
        }
    }

    /// Failure percentage over counted items, 0.0 when nothing was counted
    pub fn failure_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 * 100.0 / self.total as f64
        }
    }
}

/// Decision rendered by a [`FailurePolicy`]
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Breach { cause: String },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// How many item failures a batch may absorb
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "threshold", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed item fails the batch
    ZeroTolerance,
    /// The batch fails only when the failure percentage exceeds the threshold
    ToleratedPercentage(f64),
}

impl FailurePolicy {
    pub fn evaluate(&self, tally: &Tally) -> Verdict {
        match *self {
            Self::ZeroTolerance if tally.failed > 0 => Verdict::Breach {
                cause: format!(
                    "zero tolerance breached: any item failure fails the batch \
                     ({} of {} items failed)",
                    tally.failed, tally.total
                ),
            },
            Self::ToleratedPercentage(threshold) if tally.failure_percentage() > threshold => {
                let (observed, tolerated) =
                    format_distinct(tally.failure_percentage(), threshold);
                Verdict::Breach {
                    cause: format!("tolerance threshold exceeded: {observed}% > {tolerated}%"),
                }
            }
            _ => Verdict::Pass,
        }
    }
}

const MIN_DECIMALS: usize = 2;
const MAX_DECIMALS: usize = 10;

/// Format both values with the fewest decimals (at least two) that tell
/// them apart, so 10.001 against 10 reads "10.001" and "10"
fn format_distinct(observed: f64, threshold: f64) -> (String, String) {
    (MIN_DECIMALS..=MAX_DECIMALS)
        .map(|decimals| {
            (
                format_with_decimals(observed, decimals),
                format_with_decimals(threshold, decimals),
            )
        })
        .find(|(a, b)| a != b)
        .unwrap_or_else(|| {
            (
                format_with_decimals(observed, MAX_DECIMALS),
                format_with_decimals(threshold, MAX_DECIMALS),
            )
        })
}

/// Trailing zeros dropped (15.0 -> "15", 12.5 -> "12.5")
fn format_with_decimals(value: f64, decimals: usize) -> String {
    let formatted = format!("{value:.decimals$}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}
