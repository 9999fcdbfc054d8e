//! Item state machine for the queue.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Item status.
///
/// State transitions:
/// - Pending -> InFlight -> Completed
/// - Pending -> InFlight -> RetryScheduled -> (eligible) -> InFlight ...
/// - Pending -> InFlight -> DeadLettered
/// - DeadLettered is also entered directly for classifier rejections.
///
/// `RetryScheduled` differs from `Pending` only by a future `next_eligible_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting for dispatch.
    Pending,

    /// Handed to a worker by `next_batch`.
    InFlight,

    /// Processed successfully (or completed as a content duplicate).
    Completed,

    /// Failed, waiting for its backoff to elapse.
    RetryScheduled,

    /// Given up on; a dead-letter entry exists.
    DeadLettered,
}

impl ItemStatus {
    /// Is this a terminal state (no further automatic transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::DeadLettered)
    }

    /// Does this item occupy active queue capacity?
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Is `self -> next` a legal transition?
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (RetryScheduled, InFlight)
                | (InFlight, Completed)
                | (InFlight, RetryScheduled)
                | (InFlight, DeadLettered)
                // content-duplicate completion can land while queued
                | (Pending, Completed)
                | (RetryScheduled, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InFlight => "in_flight",
            ItemStatus::Completed => "completed",
            ItemStatus::RetryScheduled => "retry_scheduled",
            ItemStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
