//! Backpressure levels.
//!
//! The queue only signals pressure; throttling is the submitter's job. The one
//! exception is `Reject`, under which `submit` refuses low-priority items.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureLevel {
    Normal,
    Elevated,
    Reject,
}

impl BackpressureLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            BackpressureLevel::Normal => "normal",
            BackpressureLevel::Elevated => "elevated",
            BackpressureLevel::Reject => "reject",
        }
    }
}

impl fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Active items at which the signal turns `Elevated`.
    pub high_water: usize,
    /// Active items at which the signal turns `Reject`.
    pub reject_threshold: usize,
    /// Under `Reject`, submissions below this priority are refused.
    pub min_priority_under_reject: i32,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_water: 5_000,
            reject_threshold: 10_000,
            min_priority_under_reject: 10,
        }
    }
}

impl BackpressureConfig {
    /// Level for `active` non-terminal items.
    pub fn level(&self, active: usize) -> BackpressureLevel {
        if active >= self.reject_threshold {
            BackpressureLevel::Reject
        } else if active >= self.high_water {
            BackpressureLevel::Elevated
        } else {
            BackpressureLevel::Normal
        }
    }

    /// Would a submission at `priority` be refused at `level`?
    pub fn refuses(&self, level: BackpressureLevel, priority: i32) -> bool {
        level == BackpressureLevel::Reject && priority < self.min_priority_under_reject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> BackpressureConfig {
        BackpressureConfig {
            high_water: 3,
            reject_threshold: 5,
            min_priority_under_reject: 10,
        }
    }

    #[rstest]
    #[case(0, BackpressureLevel::Normal)]
    #[case(2, BackpressureLevel::Normal)]
    #[case(3, BackpressureLevel::Elevated)]
    #[case(4, BackpressureLevel::Elevated)]
    #[case(5, BackpressureLevel::Reject)]
    #[case(50, BackpressureLevel::Reject)]
    fn level_thresholds(#[case] active: usize, #[case] expected: BackpressureLevel) {
        assert_eq!(config().level(active), expected);
    }

    #[test]
    fn only_low_priority_is_refused_under_reject() {
        let config = config();
        assert!(config.refuses(BackpressureLevel::Reject, 9));
        assert!(!config.refuses(BackpressureLevel::Reject, 10));
        assert!(!config.refuses(BackpressureLevel::Elevated, -100));
    }
}
