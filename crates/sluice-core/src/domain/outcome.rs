//! Outcome model: the values every public operation answers with.
//!
//! Expected conditions (duplicates, unprocessable references, backpressure,
//! retries, give-ups) are variants here, never errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dead_letter::ReasonCode;
use super::errors::ErrorKind;
use super::ids::ItemId;

/// What the external processor reports for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Success,
    Failure {
        kind: ErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl ProcessOutcome {
    pub fn success() -> Self {
        ProcessOutcome::Success
    }

    pub fn failure(kind: ErrorKind) -> Self {
        ProcessOutcome::Failure { kind, detail: None }
    }

    pub fn failure_with(kind: ErrorKind, detail: impl Into<String>) -> Self {
        ProcessOutcome::Failure {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Success)
    }
}

/// Answer to `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubmissionResult {
    /// A fresh `pending` item was inserted.
    Admitted { item_id: ItemId },
    /// Same canonical key is pending, in flight or awaiting retry.
    DuplicateOfActive { item_id: ItemId },
    /// Same canonical key already completed.
    DuplicateOfCompleted { item_id: ItemId },
    /// Same canonical key sits in the dead-letter store; use requeue instead.
    DuplicateOfDeadLettered { item_id: ItemId },
    /// The classifier refused the reference; it went straight to dead letter.
    Unprocessable { item_id: ItemId, reason: ReasonCode },
    /// Queue is at the reject threshold and the priority is below the floor.
    RejectedBackpressure { active_items: usize, min_priority: i32 },
}

impl SubmissionResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, SubmissionResult::Admitted { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            SubmissionResult::DuplicateOfActive { .. }
                | SubmissionResult::DuplicateOfCompleted { .. }
                | SubmissionResult::DuplicateOfDeadLettered { .. }
        )
    }

    /// The item this answer refers to, if any.
    pub fn item_id(&self) -> Option<ItemId> {
        match self {
            SubmissionResult::Admitted { item_id }
            | SubmissionResult::DuplicateOfActive { item_id }
            | SubmissionResult::DuplicateOfCompleted { item_id }
            | SubmissionResult::DuplicateOfDeadLettered { item_id }
            | SubmissionResult::Unprocessable { item_id, .. } => Some(*item_id),
            SubmissionResult::RejectedBackpressure { .. } => None,
        }
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SubmissionResult::Admitted { .. } => "admitted",
            SubmissionResult::DuplicateOfActive { .. } => "duplicate_of_active",
            SubmissionResult::DuplicateOfCompleted { .. } => "duplicate_of_completed",
            SubmissionResult::DuplicateOfDeadLettered { .. } => "duplicate_of_dead_lettered",
            SubmissionResult::Unprocessable { .. } => "unprocessable",
            SubmissionResult::RejectedBackpressure { .. } => "rejected_backpressure",
        }
    }
}

/// Answer to `report_outcome`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReportResult {
    Completed,
    RetryScheduled {
        next_eligible_at: DateTime<Utc>,
        attempt_count: u32,
    },
    DeadLettered { reason: ReasonCode },
    /// The item was already completed as a content duplicate while in flight.
    AlreadyCompleted { duplicate_of: Option<ItemId> },
}

impl ReportResult {
    pub fn label(&self) -> &'static str {
        match self {
            ReportResult::Completed => "completed",
            ReportResult::RetryScheduled { .. } => "retry_scheduled",
            ReportResult::DeadLettered { .. } => "dead_lettered",
            ReportResult::AlreadyCompleted { .. } => "already_completed",
        }
    }
}

/// Answer to `mark_content_fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FingerprintResult {
    /// No completed item has this content; keep processing.
    Unique,
    /// Identical content already completed under another key; the item has
    /// been completed as a duplicate and needs no further work.
    DuplicateOfCompleted { original: ItemId },
}
