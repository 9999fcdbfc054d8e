//! Queue item record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ItemStatus;
use crate::classifier::Strategy;
use crate::domain::{CanonicalKey, ContentFingerprint, DeadLetterEntry, ErrorKind, ItemId, ReasonCode};

/// One unit of work.
///
/// Design:
/// - This is the single source of truth for an item's state.
/// - Queue structures (ready/scheduled/in_flight) hold ItemId only.
/// - Status changes go through the `mark_*` methods, which refuse illegal
///   transitions instead of applying them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub item_id: ItemId,
    pub canonical_key: CanonicalKey,
    pub raw_reference: String,
    pub source_key: String,
    pub classification: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_fingerprint: Option<ContentFingerprint>,

    pub status: ItemStatus,
    pub priority: i32,

    /// How many times this canonical key had been admitted before this item.
    pub generation: u32,
    /// Submission order, breaks ties within a priority band.
    pub seq: u64,

    /// Failed attempts reported so far.
    pub attempt_count: u32,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error_detail: Option<String>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub next_eligible_at: Option<DateTime<Utc>>,

    /// Set when completed because identical content was already processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<ItemId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields of a fresh submission.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub item_id: ItemId,
    pub canonical_key: CanonicalKey,
    pub raw_reference: String,
    pub source_key: String,
    pub classification: Strategy,
    pub content_type_hint: Option<String>,
    pub priority: i32,
    pub generation: u32,
    pub seq: u64,
}

impl QueueItem {
    pub fn new(new: NewItem, now: DateTime<Utc>) -> Self {
        Self {
            item_id: new.item_id,
            canonical_key: new.canonical_key,
            raw_reference: new.raw_reference,
            source_key: new.source_key,
            classification: new.classification,
            content_type_hint: new.content_type_hint,
            content_fingerprint: None,
            status: ItemStatus::Pending,
            priority: new.priority,
            generation: new.generation,
            seq: new.seq,
            attempt_count: 0,
            last_error_kind: None,
            last_error_detail: None,
            last_attempted_at: None,
            next_eligible_at: None,
            duplicate_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Eligible for dispatch at `now` (ignoring breakers).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ItemStatus::Pending => true,
            ItemStatus::RetryScheduled => self.next_eligible_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// When the item last became dispatchable. Used for priority aging.
    pub fn eligible_since(&self) -> DateTime<Utc> {
        self.next_eligible_at.unwrap_or(self.created_at)
    }

    fn transition(&mut self, next: ItemStatus, now: DateTime<Utc>) -> Result<(), ItemStatus> {
        if !self.status.can_transition_to(next) {
            return Err(self.status);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Pending/RetryScheduled -> InFlight.
    pub fn mark_in_flight(&mut self, now: DateTime<Utc>) -> Result<(), ItemStatus> {
        self.transition(ItemStatus::InFlight, now)?;
        self.last_attempted_at = Some(now);
        Ok(())
    }

    /// InFlight -> Completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Result<(), ItemStatus> {
        self.transition(ItemStatus::Completed, now)?;
        self.next_eligible_at = None;
        Ok(())
    }

    /// Completed because `original` already produced the same content.
    pub fn mark_completed_as_duplicate(
        &mut self,
        original: ItemId,
        now: DateTime<Utc>,
    ) -> Result<(), ItemStatus> {
        self.transition(ItemStatus::Completed, now)?;
        self.next_eligible_at = None;
        self.duplicate_of = Some(original);
        Ok(())
    }

    /// Record a failed attempt. Does not change status.
    pub fn record_failure(&mut self, kind: ErrorKind, detail: Option<String>, now: DateTime<Utc>) {
        self.attempt_count += 1;
        self.last_error_kind = Some(kind);
        self.last_error_detail = detail;
        self.updated_at = now;
    }

    /// InFlight -> RetryScheduled.
    pub fn schedule_retry(
        &mut self,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), ItemStatus> {
        self.transition(ItemStatus::RetryScheduled, now)?;
        self.next_eligible_at = Some(next_eligible_at);
        Ok(())
    }

    /// InFlight -> DeadLettered.
    pub fn mark_dead_lettered(&mut self, now: DateTime<Utc>) -> Result<(), ItemStatus> {
        self.transition(ItemStatus::DeadLettered, now)?;
        self.next_eligible_at = None;
        Ok(())
    }

    /// Build the quarantine record for this item.
    pub fn dead_letter_entry(&self, reason_code: ReasonCode, now: DateTime<Utc>) -> DeadLetterEntry {
        DeadLetterEntry {
            item_id: self.item_id,
            canonical_key: self.canonical_key.clone(),
            generation: self.generation,
            reason_code,
            last_error_detail: self.last_error_detail.clone(),
            last_error_kind: self.last_error_kind,
            attempt_count: self.attempt_count,
            quarantined_at: now,
            raw_reference: self.raw_reference.clone(),
            source_key: self.source_key.clone(),
            priority: self.priority,
            content_type_hint: self.content_type_hint.clone(),
        }
    }
}
