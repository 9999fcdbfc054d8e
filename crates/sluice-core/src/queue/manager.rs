//! Queue Manager - 調整役
//!
//! Owns every item, the dead-letter store, the dedup registry and the breaker
//! registry behind one mutex. All mutation goes through it, which gives:
//! - exactly one `Admitted` per canonical key among concurrent submitters
//! - no item handed to two `next_batch` callers
//! - breaker transitions serialized with the item transitions that cause them
//!
//! Persistence: after each mutating call the manager writes a snapshot through
//! the `ItemStore` port. Snapshots carry a revision so a slow older save never
//! overwrites a newer one. A failed save leaves the state dirty; the change
//! and the caller's result stand, and the next save carries them.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::{
    BackpressureConfig, BackpressureLevel, ItemStatus, NewItem, QueueItem, RetryDecision,
    RetryScheduler,
};
use crate::breaker::{Attempt, CircuitBreakerRegistry, CircuitBreakerState};
use crate::classifier::{ClassificationResult, Classifier};
use crate::config::{AgingConfig, SluiceConfig};
use crate::dedup::{DedupOutcome, Deduplicator, KeyState, canonicalize};
use crate::domain::{
    CanonicalKey, ContentFingerprint, DeadLetterEntry, ErrorKind, FingerprintResult, ItemId, ProcessOutcome,
    ReasonCode, ReportResult, SubmissionResult,
};
use crate::error::{Result, SluiceError};
use crate::metrics;
use crate::observability::QueueCounts;
use crate::ports::{Clock, ItemStore, SNAPSHOT_VERSION, Snapshot};

/// Ready-queue key: higher priority first, then submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyEntry {
    priority: Reverse<i32>,
    seq: u64,
    item_id: ItemId,
}

impl ReadyEntry {
    fn of(item: &QueueItem) -> Self {
        Self {
            priority: Reverse(item.priority),
            seq: item.seq,
            item_id: item.item_id,
        }
    }
}

/// Retry backoff entry.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledItem {
    next_eligible_at: DateTime<Utc>,
    item_id: ItemId,
}

impl PartialOrd for ScheduledItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .next_eligible_at
            .cmp(&self.next_eligible_at)
            .then_with(|| other.item_id.cmp(&self.item_id))
    }
}

/// Log an invariant violation and build the matching error.
fn inconsistency(item_id: ItemId, detail: impl Into<String>) -> SluiceError {
    let detail = detail.into();
    error!(%item_id, inconsistency = true, detail = %detail, "queue store inconsistency");
    SluiceError::inconsistency(item_id, detail)
}

fn duplicate_result(outcome: DedupOutcome) -> SubmissionResult {
    match outcome {
        DedupOutcome::Admitted { item_id, .. } => SubmissionResult::Admitted { item_id },
        DedupOutcome::DuplicateOfActive(item_id) => SubmissionResult::DuplicateOfActive { item_id },
        DedupOutcome::DuplicateOfCompleted(item_id) => {
            SubmissionResult::DuplicateOfCompleted { item_id }
        }
        DedupOutcome::DuplicateOfDeadLettered(item_id) => {
            SubmissionResult::DuplicateOfDeadLettered { item_id }
        }
    }
}

fn key_state(status: ItemStatus) -> KeyState {
    match status {
        ItemStatus::Completed => KeyState::Completed,
        ItemStatus::DeadLettered => KeyState::DeadLettered,
        _ => KeyState::Active,
    }
}

struct SubmitRequest<'a> {
    raw_reference: &'a str,
    source_key: &'a str,
    priority: i32,
    content_type_hint: Option<&'a str>,
}

/// Everything behind the manager's mutex.
struct ManagerState {
    /// All item records (single source of truth).
    items: HashMap<ItemId, QueueItem>,
    dead_letters: HashMap<ItemId, DeadLetterEntry>,
    dedup: Deduplicator,
    breakers: CircuitBreakerRegistry,

    /// Dispatchable items (ItemIds only).
    ready: BTreeSet<ReadyEntry>,
    /// Retry backoff. Entries go stale when the item moves on; promotion skips them.
    scheduled: BinaryHeap<ScheduledItem>,
    /// Dispatched items and the breaker grant each one went out under.
    in_flight: HashMap<ItemId, Attempt>,
    /// Non-terminal items, kept in step with every status change.
    active: usize,

    next_seq: u64,
    revision: u64,
    dirty: bool,

    classifier: Classifier,
    scheduler: RetryScheduler,
    backpressure: BackpressureConfig,
    aging: Option<AgingConfig>,
}

impl ManagerState {
    fn new(config: &SluiceConfig, scheduler: RetryScheduler) -> Self {
        Self {
            items: HashMap::new(),
            dead_letters: HashMap::new(),
            dedup: Deduplicator::new(),
            breakers: CircuitBreakerRegistry::new(config.breaker.clone()),
            ready: BTreeSet::new(),
            scheduled: BinaryHeap::new(),
            in_flight: HashMap::new(),
            active: 0,
            next_seq: 0,
            revision: 0,
            dirty: false,
            classifier: Classifier::new(config.classifier.clone()),
            scheduler,
            backpressure: config.backpressure.clone(),
            aging: config.aging,
        }
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn active_count(&self) -> usize {
        self.active
    }

    fn counts(&self) -> QueueCounts {
        let mut counts: QueueCounts = self.items.values().map(|i| i.status).collect();
        counts.dead_lettered = self.dead_letters.len();
        counts
    }

    fn take_snapshot(&mut self) -> Option<(Snapshot, u64)> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        self.revision += 1;

        let mut items: Vec<QueueItem> = self.items.values().cloned().collect();
        items.sort_by_key(|i| i.seq);
        let mut dead_letters: Vec<DeadLetterEntry> = self.dead_letters.values().cloned().collect();
        dead_letters.sort_by(|a, b| {
            a.quarantined_at
                .cmp(&b.quarantined_at)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            next_seq: self.next_seq,
            items,
            dead_letters,
        };
        Some((snapshot, self.revision))
    }

    // ── admission ────────────────────────────────────────────────────────

    fn submit(&mut self, request: SubmitRequest<'_>, now: DateTime<Utc>) -> SubmissionResult {
        let classification = self
            .classifier
            .classify(request.raw_reference, request.content_type_hint);
        let key = canonicalize(request.raw_reference);

        if !classification.processable {
            let reason = classification.reason.unwrap_or(ReasonCode::UnprocessableEmpty);
            return self.quarantine(request, key, reason, now);
        }

        if let Some(duplicate) = self.dedup.check(&key) {
            return duplicate_result(duplicate);
        }

        let active = self.active_count();
        let level = self.backpressure.level(active);
        if self.backpressure.refuses(level, request.priority) {
            info!(
                canonical_key = %key,
                priority = request.priority,
                active_items = active,
                "submission refused under backpressure"
            );
            return SubmissionResult::RejectedBackpressure {
                active_items: active,
                min_priority: self.backpressure.min_priority_under_reject,
            };
        }

        let (item_id, generation) = match self.dedup.register_or_reject(&key) {
            DedupOutcome::Admitted {
                item_id,
                generation,
            } => (item_id, generation),
            other => return duplicate_result(other),
        };

        let seq = self.allocate_seq();
        let item = QueueItem::new(
            NewItem {
                item_id,
                canonical_key: key,
                raw_reference: request.raw_reference.to_string(),
                source_key: request.source_key.to_string(),
                classification: classification.strategy,
                content_type_hint: request.content_type_hint.map(str::to_string),
                priority: request.priority,
                generation,
                seq,
            },
            now,
        );
        debug!(
            %item_id,
            canonical_key = %item.canonical_key,
            source_key = %item.source_key,
            priority = item.priority,
            strategy = item.classification.as_str(),
            "item admitted"
        );
        self.ready.insert(ReadyEntry::of(&item));
        self.items.insert(item_id, item);
        self.active += 1;
        self.dirty = true;
        SubmissionResult::Admitted { item_id }
    }

    /// Classifier rejection: straight to the dead-letter store, once per key.
    fn quarantine(
        &mut self,
        request: SubmitRequest<'_>,
        key: CanonicalKey,
        reason: ReasonCode,
        now: DateTime<Utc>,
    ) -> SubmissionResult {
        match self.dedup.register_quarantined(&key) {
            Ok(item_id) => {
                warn!(
                    %item_id,
                    canonical_key = %key,
                    source_key = request.source_key,
                    reason = %reason,
                    "reference quarantined at admission"
                );
                metrics::record_dead_letter(reason.as_str());
                self.dead_letters.insert(
                    item_id,
                    DeadLetterEntry {
                        item_id,
                        canonical_key: key,
                        generation: 0,
                        reason_code: reason,
                        last_error_detail: None,
                        last_error_kind: None,
                        attempt_count: 0,
                        quarantined_at: now,
                        raw_reference: request.raw_reference.to_string(),
                        source_key: request.source_key.to_string(),
                        priority: request.priority,
                        content_type_hint: request.content_type_hint.map(str::to_string),
                    },
                );
                self.dirty = true;
                SubmissionResult::Unprocessable { item_id, reason }
            }
            Err(DedupOutcome::DuplicateOfDeadLettered(item_id)) => {
                let reason = self
                    .dead_letters
                    .get(&item_id)
                    .map_or(reason, |entry| entry.reason_code);
                SubmissionResult::Unprocessable { item_id, reason }
            }
            Err(other) => duplicate_result(other),
        }
    }

    // ── dispatch ─────────────────────────────────────────────────────────

    /// Move retry items whose backoff has elapsed into the ready set.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.next_eligible_at > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            if let Some(item) = self.items.get(&entry.item_id)
                && item.status == ItemStatus::RetryScheduled
                && item.next_eligible_at == Some(entry.next_eligible_at)
            {
                self.ready.insert(ReadyEntry::of(item));
            }
        }
    }

    /// A ready entry must point at a queued, untracked item.
    fn ready_item(&self, item_id: ItemId) -> Result<&QueueItem> {
        let item = self
            .items
            .get(&item_id)
            .ok_or_else(|| inconsistency(item_id, "ready entry without an item record"))?;
        if !matches!(item.status, ItemStatus::Pending | ItemStatus::RetryScheduled) {
            return Err(inconsistency(
                item_id,
                format!("ready entry for an item in status {}", item.status),
            ));
        }
        if self.in_flight.contains_key(&item_id) {
            return Err(inconsistency(item_id, "ready item is also accounted in flight"));
        }
        Ok(item)
    }

    /// Ready items by effective (aged) priority, then submission order.
    fn aged_order(&self, aging: &AgingConfig, now: DateTime<Utc>) -> Result<Vec<ItemId>> {
        let mut order = Vec::with_capacity(self.ready.len());
        for entry in &self.ready {
            let item = self.ready_item(entry.item_id)?;
            let boost = aging.boost_after(now - item.eligible_since());
            order.push((Reverse(item.priority.saturating_add(boost)), item.seq, item.item_id));
        }
        order.sort_unstable();
        Ok(order.into_iter().map(|(_, _, id)| id).collect())
    }

    /// Read-only selection: walk `order`, skip sources whose breaker refuses.
    fn pick(
        &self,
        order: impl Iterator<Item = ItemId>,
        max_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ItemId>> {
        let mut picked = Vec::new();
        let mut reserved: HashMap<&str, u32> = HashMap::new();
        for item_id in order {
            if picked.len() >= max_size {
                break;
            }
            let item = self.ready_item(item_id)?;
            let source = item.source_key.as_str();
            let taken = reserved.get(source).copied().unwrap_or(0);
            if !self.breakers.would_allow(source, now, taken) {
                continue;
            }
            *reserved.entry(source).or_default() += 1;
            picked.push(item_id);
        }
        Ok(picked)
    }

    fn next_batch(&mut self, max_size: usize, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        self.promote_due(now);

        let picked = match self.aging {
            None => self.pick(self.ready.iter().map(|e| e.item_id), max_size, now)?,
            Some(aging) => {
                let order = self.aged_order(&aging, now)?;
                self.pick(order.into_iter(), max_size, now)?
            }
        };

        let mut batch = Vec::with_capacity(picked.len());
        for item_id in picked {
            let Some(item) = self.items.get_mut(&item_id) else {
                continue;
            };
            let Some(attempt) = self.breakers.allow(&item.source_key, now) else {
                continue;
            };
            let entry = ReadyEntry::of(item);
            if let Err(status) = item.mark_in_flight(now) {
                self.breakers.release_probe(&item.source_key, attempt);
                return Err(inconsistency(item_id, format!("cannot dispatch from {status}")));
            }
            self.ready.remove(&entry);
            self.in_flight.insert(item_id, attempt);
            debug!(
                %item_id,
                source_key = %item.source_key,
                attempt_count = item.attempt_count,
                probe = matches!(attempt, Attempt::Probe { .. }),
                "item dispatched"
            );
            batch.push(item.clone());
        }
        if !batch.is_empty() {
            self.dirty = true;
        }
        Ok(batch)
    }

    // ── outcomes ─────────────────────────────────────────────────────────

    fn report_outcome(
        &mut self,
        item_id: ItemId,
        outcome: ProcessOutcome,
        now: DateTime<Utc>,
    ) -> Result<ReportResult> {
        let item = self
            .items
            .get(&item_id)
            .ok_or(SluiceError::ItemNotFound(item_id))?;
        let tracked = self.in_flight.contains_key(&item_id);

        match (item.status, tracked) {
            (ItemStatus::InFlight, true) => {}
            (ItemStatus::Completed, false) if item.duplicate_of.is_some() => {
                return Ok(ReportResult::AlreadyCompleted {
                    duplicate_of: item.duplicate_of,
                });
            }
            (ItemStatus::InFlight, false) => {
                return Err(inconsistency(
                    item_id,
                    "status in_flight without in-flight accounting",
                ));
            }
            (status, true) => {
                return Err(inconsistency(
                    item_id,
                    format!("accounted in flight while status is {status}"),
                ));
            }
            (status, false) => return Err(SluiceError::NotInFlight { item_id, status }),
        }

        match outcome {
            ProcessOutcome::Success => self.complete(item_id, now),
            ProcessOutcome::Failure { kind, detail } => self.fail(item_id, kind, detail, now),
        }
    }

    fn complete(&mut self, item_id: ItemId, now: DateTime<Utc>) -> Result<ReportResult> {
        let item = self
            .items
            .get_mut(&item_id)
            .ok_or(SluiceError::ItemNotFound(item_id))?;
        item.mark_completed(now)
            .map_err(|status| inconsistency(item_id, format!("cannot complete from {status}")))?;

        let attempt = self.in_flight.remove(&item_id).unwrap_or(Attempt::Regular);
        self.active = self.active.saturating_sub(1);
        self.dedup
            .set_state(&item.canonical_key, item_id, KeyState::Completed);
        if let Some(fingerprint) = &item.content_fingerprint {
            self.dedup
                .record_fingerprint(fingerprint.clone(), item_id, &item.canonical_key);
        }
        self.breakers
            .report_outcome(&item.source_key, attempt, true, now);
        self.dirty = true;

        info!(
            %item_id,
            canonical_key = %item.canonical_key,
            source_key = %item.source_key,
            "item completed"
        );
        Ok(ReportResult::Completed)
    }

    /// Failure path: breaker, then retry scheduler, then retry or dead letter.
    fn fail(
        &mut self,
        item_id: ItemId,
        kind: ErrorKind,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReportResult> {
        let item = self
            .items
            .get_mut(&item_id)
            .ok_or(SluiceError::ItemNotFound(item_id))?;
        if item.status != ItemStatus::InFlight {
            return Err(inconsistency(
                item_id,
                format!("failure reported from status {}", item.status),
            ));
        }

        let decision = self.scheduler.schedule_retry(item.attempt_count, kind, now);
        item.record_failure(kind, detail, now);
        let attempt = self.in_flight.remove(&item_id).unwrap_or(Attempt::Regular);
        if kind.counts_against_source() {
            self.breakers
                .report_outcome(&item.source_key, attempt, false, now);
        } else {
            self.breakers.release_probe(&item.source_key, attempt);
        }
        self.dirty = true;

        match decision {
            RetryDecision::Retry {
                next_eligible_at,
                delay,
            } => {
                item.schedule_retry(next_eligible_at, now)
                    .map_err(|status| inconsistency(item_id, format!("cannot retry from {status}")))?;
                self.scheduled.push(ScheduledItem {
                    next_eligible_at,
                    item_id,
                });
                info!(
                    %item_id,
                    source_key = %item.source_key,
                    error_kind = %kind,
                    attempt_count = item.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                Ok(ReportResult::RetryScheduled {
                    next_eligible_at,
                    attempt_count: item.attempt_count,
                })
            }
            RetryDecision::GiveUp { reason } => {
                item.mark_dead_lettered(now).map_err(|status| {
                    inconsistency(item_id, format!("cannot dead-letter from {status}"))
                })?;
                let entry = item.dead_letter_entry(reason, now);
                self.active = self.active.saturating_sub(1);
                self.dedup
                    .set_state(&item.canonical_key, item_id, KeyState::DeadLettered);
                warn!(
                    %item_id,
                    canonical_key = %item.canonical_key,
                    source_key = %item.source_key,
                    error_kind = %kind,
                    attempt_count = item.attempt_count,
                    reason = %reason,
                    "item dead-lettered"
                );
                metrics::record_dead_letter(reason.as_str());
                self.dead_letters.insert(item_id, entry);
                Ok(ReportResult::DeadLettered { reason })
            }
        }
    }

    fn mark_content_fingerprint(
        &mut self,
        item_id: ItemId,
        fingerprint: ContentFingerprint,
        now: DateTime<Utc>,
    ) -> Result<FingerprintResult> {
        let item = self
            .items
            .get(&item_id)
            .ok_or(SluiceError::ItemNotFound(item_id))?;
        if item.status.is_terminal() {
            return Err(SluiceError::NotInFlight {
                item_id,
                status: item.status,
            });
        }
        let tracked = self.in_flight.contains_key(&item_id);
        if (item.status == ItemStatus::InFlight) != tracked {
            return Err(inconsistency(
                item_id,
                format!("status {} disagrees with in-flight accounting", item.status),
            ));
        }
        let original = self
            .dedup
            .completed_with_fingerprint(&fingerprint, &item.canonical_key);

        let item = self
            .items
            .get_mut(&item_id)
            .ok_or(SluiceError::ItemNotFound(item_id))?;
        item.content_fingerprint = Some(fingerprint);
        item.updated_at = now;
        self.dirty = true;

        let Some(original) = original else {
            return Ok(FingerprintResult::Unique);
        };

        let entry = ReadyEntry::of(item);
        item.mark_completed_as_duplicate(original, now)
            .map_err(|status| inconsistency(item_id, format!("cannot complete from {status}")))?;
        self.ready.remove(&entry);
        self.active = self.active.saturating_sub(1);
        self.dedup
            .set_state(&item.canonical_key, item_id, KeyState::Completed);
        if let Some(attempt) = self.in_flight.remove(&item_id) {
            // the fetch itself worked
            self.breakers
                .report_outcome(&item.source_key, attempt, true, now);
        }
        info!(
            %item_id,
            %original,
            canonical_key = %item.canonical_key,
            "item completed as content duplicate"
        );
        metrics::record_outcome("duplicate_content");
        Ok(FingerprintResult::DuplicateOfCompleted { original })
    }

    // ── recovery ─────────────────────────────────────────────────────────

    fn requeue_dead_letter(&mut self, item_id: ItemId, now: DateTime<Utc>) -> Result<SubmissionResult> {
        let entry = self
            .dead_letters
            .get(&item_id)
            .ok_or(SluiceError::DeadLetterNotFound(item_id))?;

        let classification: ClassificationResult = self
            .classifier
            .classify(&entry.raw_reference, entry.content_type_hint.as_deref());
        if !classification.processable {
            let reason = classification.reason.unwrap_or(entry.reason_code);
            return Ok(SubmissionResult::Unprocessable { item_id, reason });
        }

        match self.dedup.state_of(&entry.canonical_key) {
            Some((registered, KeyState::DeadLettered)) if registered == item_id => {}
            _ => {
                return Err(inconsistency(
                    item_id,
                    "dead-letter entry is not the current item for its key",
                ));
            }
        }
        let (new_id, generation) = self
            .dedup
            .readmit(&entry.canonical_key)
            .ok_or_else(|| inconsistency(item_id, "dead-lettered key refused readmission"))?;

        let Some(entry) = self.dead_letters.remove(&item_id) else {
            return Err(SluiceError::DeadLetterNotFound(item_id));
        };
        self.items.remove(&item_id);

        let seq = self.allocate_seq();
        let item = QueueItem::new(
            NewItem {
                item_id: new_id,
                canonical_key: entry.canonical_key,
                raw_reference: entry.raw_reference,
                source_key: entry.source_key,
                classification: classification.strategy,
                content_type_hint: entry.content_type_hint,
                priority: entry.priority,
                generation,
                seq,
            },
            now,
        );
        info!(
            item_id = %new_id,
            requeued_from = %item_id,
            previous_reason = %entry.reason_code,
            "dead letter requeued"
        );
        self.ready.insert(ReadyEntry::of(&item));
        self.items.insert(new_id, item);
        self.active += 1;
        self.dirty = true;
        Ok(SubmissionResult::Admitted { item_id: new_id })
    }

    /// Rebuild every index from a snapshot. Returns items that were in flight.
    fn restore(&mut self, snapshot: Snapshot) -> Result<Vec<ItemId>> {
        let mut interrupted = Vec::new();

        for item in snapshot.items {
            let state = key_state(item.status);
            if state == KeyState::Active
                && let Some((other, KeyState::Active)) = self.dedup.state_of(&item.canonical_key)
            {
                return Err(inconsistency(
                    item.item_id,
                    format!("canonical key also active under {other}"),
                ));
            }
            self.dedup
                .restore(&item.canonical_key, item.item_id, item.generation, state);

            match item.status {
                ItemStatus::Pending => {
                    self.ready.insert(ReadyEntry::of(&item));
                }
                ItemStatus::RetryScheduled => match item.next_eligible_at {
                    Some(next_eligible_at) => self.scheduled.push(ScheduledItem {
                        next_eligible_at,
                        item_id: item.item_id,
                    }),
                    None => {
                        self.ready.insert(ReadyEntry::of(&item));
                    }
                },
                ItemStatus::InFlight => {
                    self.in_flight.insert(item.item_id, Attempt::Regular);
                    interrupted.push((item.seq, item.item_id));
                }
                ItemStatus::Completed => {
                    if item.duplicate_of.is_none()
                        && let Some(fingerprint) = &item.content_fingerprint
                    {
                        self.dedup.record_fingerprint(
                            fingerprint.clone(),
                            item.item_id,
                            &item.canonical_key,
                        );
                    }
                }
                ItemStatus::DeadLettered => {}
            }
            if item.status.is_active() {
                self.active += 1;
            }
            self.next_seq = self.next_seq.max(item.seq + 1);
            self.items.insert(item.item_id, item);
        }

        for entry in snapshot.dead_letters {
            if !self.items.contains_key(&entry.item_id) {
                self.dedup.restore(
                    &entry.canonical_key,
                    entry.item_id,
                    entry.generation,
                    KeyState::DeadLettered,
                );
            }
            self.dead_letters.insert(entry.item_id, entry);
        }
        self.next_seq = self.next_seq.max(snapshot.next_seq);

        interrupted.sort_unstable();
        Ok(interrupted.into_iter().map(|(_, id)| id).collect())
    }
}

/// The ingestion queue.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct QueueManager {
    state: Mutex<ManagerState>,
    notify: Notify,
    store: Arc<dyn ItemStore>,
    saved_revision: Mutex<u64>,
    clock: Arc<dyn Clock>,
}

impl QueueManager {
    /// Load the last snapshot (if any) and rebuild the queue from it.
    ///
    /// Items found `in_flight` have no worker anymore; they go through the
    /// failure path as `interrupted`.
    pub async fn open(
        config: &SluiceConfig,
        store: Arc<dyn ItemStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let scheduler = RetryScheduler::from_config(&config.retry)?;
        let mut state = ManagerState::new(config, scheduler);
        let now = clock.now();

        if let Some(snapshot) = store.load().await? {
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(SluiceError::config(format!(
                    "unsupported snapshot version {}",
                    snapshot.version
                )));
            }
            let interrupted = state.restore(snapshot)?;
            for item_id in &interrupted {
                state.fail(
                    *item_id,
                    ErrorKind::Interrupted,
                    Some("process stopped while the item was in flight".to_string()),
                    now,
                )?;
            }
            let counts = state.counts();
            info!(
                active = counts.active(),
                completed = counts.completed,
                dead_lettered = counts.dead_lettered,
                interrupted = interrupted.len(),
                "queue state restored"
            );
        }

        let pending_save = state.take_snapshot();
        metrics::set_active_items(state.active_count());
        let manager = Self {
            state: Mutex::new(state),
            notify: Notify::new(),
            store,
            saved_revision: Mutex::new(0),
            clock,
        };
        if let Some((snapshot, revision)) = pending_save {
            manager.persist(snapshot, revision).await?;
        }
        Ok(manager)
    }

    async fn persist(&self, snapshot: Snapshot, revision: u64) -> Result<()> {
        let mut saved = self.saved_revision.lock().await;
        if *saved >= revision {
            return Ok(());
        }
        self.store.save(&snapshot).await?;
        *saved = revision;
        Ok(())
    }

    /// Run `op` under the state lock, then persist if it changed anything.
    ///
    /// A failed save keeps both the change and the result: the state is
    /// marked dirty again and the next mutation or [`QueueManager::flush`]
    /// writes it.
    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut ManagerState, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let now = self.clock.now();
        let (value, pending_save) = {
            let mut state = self.state.lock().await;
            let value = op(&mut *state, now)?;
            let pending_save = state.take_snapshot();
            if pending_save.is_some() {
                metrics::set_active_items(state.active_count());
            }
            (value, pending_save)
        };
        if let Some((snapshot, revision)) = pending_save
            && let Err(e) = self.persist(snapshot, revision).await
        {
            error!(error = %e, revision, "queue snapshot not saved; retrying on the next change");
            metrics::record_persist_failure();
            self.state.lock().await.dirty = true;
        }
        Ok(value)
    }

    /// Write out whatever a failed save left unsaved.
    pub async fn flush(&self) -> Result<()> {
        let pending_save = self.state.lock().await.take_snapshot();
        let Some((snapshot, revision)) = pending_save else {
            return Ok(());
        };
        if let Err(e) = self.persist(snapshot, revision).await {
            self.state.lock().await.dirty = true;
            return Err(e);
        }
        Ok(())
    }

    /// Classify, canonicalize, dedup, check backpressure, admit.
    pub async fn submit(
        &self,
        raw_reference: &str,
        source_key: &str,
        priority: i32,
        content_type_hint: Option<&str>,
    ) -> Result<SubmissionResult> {
        let request = SubmitRequest {
            raw_reference,
            source_key,
            priority,
            content_type_hint,
        };
        let result = self
            .mutate(|state, now| Ok(state.submit(request, now)))
            .await?;
        metrics::record_submission(result.label());
        if result.is_admitted() {
            self.notify.notify_one();
        }
        Ok(result)
    }

    /// Up to `max_size` eligible items, now marked `in_flight`.
    ///
    /// Items whose source breaker refuses are left where they are.
    pub async fn next_batch(&self, max_size: usize) -> Result<Vec<QueueItem>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }
        self.mutate(|state, now| state.next_batch(max_size, now))
            .await
    }

    pub async fn report_outcome(
        &self,
        item_id: ItemId,
        outcome: ProcessOutcome,
    ) -> Result<ReportResult> {
        let result = self
            .mutate(|state, now| state.report_outcome(item_id, outcome, now))
            .await?;
        metrics::record_outcome(result.label());
        Ok(result)
    }

    /// Record fetched content; completes the item if a completed item under
    /// another key already has identical content.
    pub async fn mark_content_fingerprint(
        &self,
        item_id: ItemId,
        fingerprint: ContentFingerprint,
    ) -> Result<FingerprintResult> {
        self.mutate(|state, now| state.mark_content_fingerprint(item_id, fingerprint, now))
            .await
    }

    /// Delete the dead-letter entry and admit a fresh item for its key.
    ///
    /// Bypasses backpressure. A reference the classifier still refuses stays
    /// quarantined and `Unprocessable` is returned.
    pub async fn requeue_dead_letter(&self, item_id: ItemId) -> Result<SubmissionResult> {
        let result = self
            .mutate(|state, now| state.requeue_dead_letter(item_id, now))
            .await?;
        if result.is_admitted() {
            self.notify.notify_one();
        }
        Ok(result)
    }

    pub async fn backpressure_signal(&self) -> BackpressureLevel {
        let state = self.state.lock().await;
        state.backpressure.level(state.active_count())
    }

    pub async fn counts_by_status(&self) -> QueueCounts {
        self.state.lock().await.counts()
    }

    pub async fn get_item(&self, item_id: ItemId) -> Option<QueueItem> {
        self.state.lock().await.items.get(&item_id).cloned()
    }

    /// Dead letters, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        let state = self.state.lock().await;
        let mut entries: Vec<DeadLetterEntry> = state.dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.quarantined_at
                .cmp(&b.quarantined_at)
                .then_with(|| a.item_id.cmp(&b.item_id))
        });
        entries
    }

    pub async fn dead_letters_by_reason(&self, reason: ReasonCode) -> Vec<DeadLetterEntry> {
        let mut entries = self.dead_letters().await;
        entries.retain(|e| e.reason_code == reason);
        entries
    }

    pub async fn breaker_state(&self, source_key: &str) -> CircuitBreakerState {
        self.state.lock().await.breakers.state(source_key)
    }

    pub async fn breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.state.lock().await.breakers.states()
    }

    /// Would an attempt against `source_key` be dispatched right now?
    /// Reserves nothing.
    pub async fn breaker_allows(&self, source_key: &str) -> bool {
        let now = self.clock.now();
        self.state
            .lock()
            .await
            .breakers
            .would_allow(source_key, now, 0)
    }

    /// Earliest pending retry time, if any item is waiting on backoff.
    pub async fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state
            .items
            .values()
            .filter(|i| i.status == ItemStatus::RetryScheduled)
            .filter_map(|i| i.next_eligible_at)
            .min()
    }

    /// Wait until something is submitted or `max_wait` passes.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {},
            _ = tokio::time::sleep(max_wait) => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemoryStore;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn manager() -> QueueManager {
        QueueManager::open(
            &SluiceConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(FixedClock::new(t0())),
        )
        .await
        .unwrap()
    }

    async fn admit(manager: &QueueManager, reference: &str, priority: i32) -> ItemId {
        let result = manager
            .submit(reference, "example.com", priority, None)
            .await
            .unwrap();
        result.item_id().unwrap()
    }

    #[test]
    fn scheduled_heap_pops_earliest_first() {
        let key = CanonicalKey::new("k");
        let mut heap = BinaryHeap::new();
        for secs in [30, 10, 20] {
            heap.push(ScheduledItem {
                next_eligible_at: t0() + chrono::Duration::seconds(secs),
                item_id: ItemId::derive(&key, secs as u32),
            });
        }
        let order: Vec<i64> = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.next_eligible_at - t0()).num_seconds())
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn untracked_in_flight_item_is_an_inconsistency() {
        let manager = manager().await;
        let id = admit(&manager, "https://example.com/a", 0).await;
        manager.next_batch(1).await.unwrap();

        manager.state.lock().await.in_flight.remove(&id);

        let err = manager
            .report_outcome(id, ProcessOutcome::success())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        // nothing was applied
        let item = manager.get_item(id).await.unwrap();
        assert_eq!(item.status, ItemStatus::InFlight);
    }

    #[tokio::test]
    async fn stale_ready_entry_aborts_dispatch() {
        let manager = manager().await;
        let id = admit(&manager, "https://example.com/a", 0).await;
        manager
            .state
            .lock()
            .await
            .items
            .get_mut(&id)
            .unwrap()
            .status = ItemStatus::Completed;

        let err = manager.next_batch(5).await.unwrap_err();
        assert!(matches!(err, SluiceError::InternalInconsistency { .. }));
        assert!(manager.state.lock().await.in_flight.is_empty());
    }

    #[tokio::test]
    async fn report_for_queued_item_is_not_in_flight() {
        let manager = manager().await;
        let id = admit(&manager, "https://example.com/a", 0).await;
        let err = manager
            .report_outcome(id, ProcessOutcome::success())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SluiceError::NotInFlight {
                status: ItemStatus::Pending,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let manager = manager().await;
        let ghost = ItemId::derive(&CanonicalKey::new("ghost"), 0);
        assert!(matches!(
            manager.report_outcome(ghost, ProcessOutcome::success()).await,
            Err(SluiceError::ItemNotFound(_))
        ));
        assert!(matches!(
            manager.requeue_dead_letter(ghost).await,
            Err(SluiceError::DeadLetterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejected_submissions_do_not_persist() {
        let store = Arc::new(MemoryStore::new());
        let manager = QueueManager::open(
            &SluiceConfig::default(),
            store.clone(),
            Arc::new(FixedClock::new(t0())),
        )
        .await
        .unwrap();

        admit(&manager, "https://example.com/a", 0).await;
        assert_eq!(store.save_count(), 1);
        admit(&manager, "https://example.com/a/", 0).await;
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn active_count_follows_status_changes() {
        let manager = manager().await;
        let done = admit(&manager, "https://example.com/done", 0).await;
        let gone = admit(&manager, "https://example.com/gone", 0).await;
        admit(&manager, "https://example.com/waiting", 0).await;
        manager.next_batch(2).await.unwrap();
        manager
            .report_outcome(done, ProcessOutcome::success())
            .await
            .unwrap();
        manager
            .report_outcome(gone, ProcessOutcome::failure(ErrorKind::ResourceGone))
            .await
            .unwrap();
        {
            let state = manager.state.lock().await;
            let scanned = state.items.values().filter(|i| i.status.is_active()).count();
            assert_eq!(scanned, 1);
            assert_eq!(state.active_count(), scanned);
        }

        manager.requeue_dead_letter(gone).await.unwrap();
        assert_eq!(manager.state.lock().await.active_count(), 2);
    }

    #[tokio::test]
    async fn higher_priority_drains_first_then_fifo() {
        let manager = manager().await;
        let low = admit(&manager, "https://example.com/low", 1).await;
        let high_a = admit(&manager, "https://example.com/high-a", 9).await;
        let high_b = admit(&manager, "https://example.com/high-b", 9).await;

        let ids: Vec<ItemId> = manager
            .next_batch(3)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.item_id)
            .collect();
        assert_eq!(ids, vec![high_a, high_b, low]);
    }
}
