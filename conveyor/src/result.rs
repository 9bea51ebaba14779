//! Stage result types.
//!
//! Every stage run produces exactly one [`StageResult`]. Results from
//! heterogeneous stages compose via [`StageResult::merge`], so a caller can
//! inspect a whole run's outcome without knowing which concrete stages ran.

use serde::{Deserialize, Serialize};

/// A single element that failed processing.
///
/// Elements are identified by their arrival ordinal rather than by value, so
/// payload types need not be printable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementFailure {
    /// Zero-based arrival position of the failing element.
    pub index: u64,
    /// Description of the failure.
    pub error: String,
}

/// Running totals a stage accumulates while processing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTally {
    /// Elements processed successfully.
    pub processed: u64,
    /// Elements whose processing failed.
    pub failed: u64,
    /// The recorded failures, in arrival order.
    #[serde(default)]
    pub failures: Vec<ElementFailure>,
}

impl ProcessTally {
    /// Records one successfully processed element.
    pub fn record_success(&mut self) {
        self.processed += 1;
    }

    /// Records one failed element.
    pub fn record_failure(&mut self, index: u64, error: impl Into<String>) {
        self.failed += 1;
        self.failures.push(ElementFailure {
            index,
            error: error.into(),
        });
    }

    /// Total number of elements seen.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.processed + self.failed
    }

    /// True if the tally has seen no elements at all.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Combines two tallies.
    #[must_use]
    pub fn merge(mut self, other: Self) -> Self {
        self.processed += other.processed;
        self.failed += other.failed;
        self.failures.extend(other.failures);
        self
    }
}

/// The terminal outcome a stage reports after finishing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StageResult {
    /// No result; the stage had nothing to report.
    #[default]
    Empty,
    /// Per-element success and failure totals.
    Tally(ProcessTally),
    /// A stage-specific aggregate, e.g. parsed entities or collected errors.
    Report {
        /// What the aggregate describes.
        label: String,
        /// The aggregate itself.
        data: serde_json::Value,
    },
    /// The stage could not complete its run at all.
    Fatal {
        /// Description of the failure.
        error: String,
    },
    /// Results from several stages, in registration order.
    Combined(Vec<StageResult>),
}

impl StageResult {
    /// Creates a stage-specific report result.
    #[must_use]
    pub fn report(label: impl Into<String>, data: serde_json::Value) -> Self {
        Self::Report {
            label: label.into(),
            data,
        }
    }

    /// Creates a fatal result.
    #[must_use]
    pub fn fatal(error: impl Into<String>) -> Self {
        Self::Fatal {
            error: error.into(),
        }
    }

    /// True unless this result, or any nested one, is fatal.
    #[must_use]
    pub fn is_success(&self) -> bool {
        match self {
            Self::Fatal { .. } => false,
            Self::Combined(results) => results.iter().all(Self::is_success),
            _ => true,
        }
    }

    /// Total successfully processed elements across nested tallies.
    #[must_use]
    pub fn processed(&self) -> u64 {
        match self {
            Self::Tally(tally) => tally.processed,
            Self::Combined(results) => results.iter().map(Self::processed).sum(),
            _ => 0,
        }
    }

    /// Total failed elements across nested tallies.
    #[must_use]
    pub fn failed(&self) -> u64 {
        match self {
            Self::Tally(tally) => tally.failed,
            Self::Combined(results) => results.iter().map(Self::failed).sum(),
            _ => 0,
        }
    }

    /// Combines two results into one.
    ///
    /// `Empty` is the identity; two tallies add up; anything else nests under
    /// `Combined`.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Empty, result) | (result, Self::Empty) => result,
            (Self::Tally(left), Self::Tally(right)) => Self::Tally(left.merge(right)),
            (Self::Combined(mut left), Self::Combined(right)) => {
                left.extend(right);
                Self::Combined(left)
            }
            (Self::Combined(mut left), right) => {
                left.push(right);
                Self::Combined(left)
            }
            (left, Self::Combined(mut right)) => {
                right.insert(0, left);
                Self::Combined(right)
            }
            (left, right) => Self::Combined(vec![left, right]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(processed: u64, failed: u64) -> StageResult {
        let mut t = ProcessTally::default();
        for _ in 0..processed {
            t.record_success();
        }
        for n in 0..failed {
            t.record_failure(n, "boom");
        }
        StageResult::Tally(t)
    }

    #[test]
    fn test_empty_is_merge_identity() {
        let result = StageResult::Empty.merge(tally(2, 0));
        assert_eq!(result.processed(), 2);

        let result = tally(2, 0).merge(StageResult::Empty);
        assert_eq!(result.processed(), 2);
    }

    #[test]
    fn test_tallies_add_up() {
        let merged = tally(2, 1).merge(tally(3, 0));
        assert_eq!(merged.processed(), 5);
        assert_eq!(merged.failed(), 1);
        assert!(matches!(merged, StageResult::Tally(_)));
    }

    #[test]
    fn test_heterogeneous_merge_nests() {
        let report = StageResult::report("entities", serde_json::json!({ "parsed": 10 }));
        let merged = tally(4, 0).merge(report);

        assert!(matches!(&merged, StageResult::Combined(parts) if parts.len() == 2));
        assert_eq!(merged.processed(), 4);
        assert!(merged.is_success());
    }

    #[test]
    fn test_nested_fatal_fails_the_whole() {
        let merged = tally(4, 0).merge(StageResult::fatal("ran aground"));
        assert!(!merged.is_success());
    }

    #[test]
    fn test_failure_records_keep_arrival_order() {
        let mut t = ProcessTally::default();
        t.record_failure(3, "first");
        t.record_failure(7, "second");

        assert_eq!(t.failed, 2);
        assert_eq!(t.failures[0].index, 3);
        assert_eq!(t.failures[1].index, 7);
    }

    #[test]
    fn test_result_serialization() {
        let result = tally(2, 1);
        let json = serde_json::to_string(&result).unwrap();
        let back: StageResult = serde_json::from_str(&json).unwrap();
        assert_eq!(result, back);
    }
}
