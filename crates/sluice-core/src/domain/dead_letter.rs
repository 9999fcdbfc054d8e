//! Dead-letter records: items the system has given up on.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;
use super::ids::{CanonicalKey, ItemId};

/// Machine-readable reason an item was quarantined.
///
/// Rendered verbatim (`Display` and serde agree) so operators see the same
/// string everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// Scheme we can never fetch (mailto:, javascript:, ...).
    UnprocessableScheme,
    /// File extension we never process (.exe, .zip, ...).
    UnprocessableExtension,
    /// Domain on the unsupported list.
    UnprocessableDomain,
    /// Blank reference.
    UnprocessableEmpty,
    /// URL that does not parse (bad host, bad port) or has no host to fetch.
    UnprocessableMalformed,
    /// Transient failures exceeded the policy's `max_attempts`.
    RetryBudgetExhausted,
    /// A permanent failure kind was reported.
    PermanentUpstreamRejection,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::UnprocessableScheme => "unprocessable_scheme",
            ReasonCode::UnprocessableExtension => "unprocessable_extension",
            ReasonCode::UnprocessableDomain => "unprocessable_domain",
            ReasonCode::UnprocessableEmpty => "unprocessable_empty",
            ReasonCode::UnprocessableMalformed => "unprocessable_malformed",
            ReasonCode::RetryBudgetExhausted => "retry_budget_exhausted",
            ReasonCode::PermanentUpstreamRejection => "permanent_upstream_rejection",
        }
    }

    /// Rejected by the classifier before ever entering the live queue.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            ReasonCode::UnprocessableScheme
                | ReasonCode::UnprocessableExtension
                | ReasonCode::UnprocessableDomain
                | ReasonCode::UnprocessableEmpty
                | ReasonCode::UnprocessableMalformed
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal quarantine record.
///
/// Created once when an item exits to `dead_lettered`; only
/// `QueueManager::requeue_dead_letter` removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub item_id: ItemId,
    pub canonical_key: CanonicalKey,
    /// Generation of the quarantined item; requeue admits `generation + 1`.
    #[serde(default)]
    pub generation: u32,
    pub reason_code: ReasonCode,
    pub last_error_detail: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub attempt_count: u32,
    pub quarantined_at: DateTime<Utc>,

    // Enough of the original submission to rebuild it on requeue.
    pub raw_reference: String,
    pub source_key: String,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type_hint: Option<String>,
}
