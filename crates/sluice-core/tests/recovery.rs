mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use common::{Harness, exact_config, t0};
use sluice_core::impls::MemoryStore;
use sluice_core::ports::{FixedClock, ItemStore, Snapshot};
use sluice_core::{
    CircuitState, ContentFingerprint, ErrorKind, FingerprintResult, ItemStatus, ProcessOutcome,
    QueueManager, ReasonCode, ReportResult, SluiceError, SubmissionResult,
};

/// Memory store whose saves fail while `full` is set.
#[derive(Default)]
struct FullDisk {
    inner: MemoryStore,
    full: AtomicBool,
}

impl FullDisk {
    fn set_full(&self, full: bool) {
        self.full.store(full, Ordering::SeqCst);
    }
}

#[async_trait]
impl ItemStore for FullDisk {
    async fn load(&self) -> sluice_core::Result<Option<Snapshot>> {
        self.inner.load().await
    }

    async fn save(&self, snapshot: &Snapshot) -> sluice_core::Result<()> {
        if self.full.load(Ordering::SeqCst) {
            return Err(SluiceError::Storage(std::io::Error::other("disk full")));
        }
        self.inner.save(snapshot).await
    }
}

#[tokio::test]
async fn restart_fails_in_flight_items_as_interrupted() {
    let config = exact_config();
    let h = Harness::open(config.clone()).await;
    let running = h.admit("https://example.com/running", "example.com", 5).await;
    let waiting = h.admit("https://example.com/waiting", "example.com", 0).await;
    assert_eq!(h.manager.next_batch(1).await.unwrap()[0].item_id, running);

    let h = h.restart(&config).await;

    let item = h.manager.get_item(running).await.unwrap();
    assert_eq!(item.status, ItemStatus::RetryScheduled);
    assert_eq!(item.attempt_count, 1);
    assert_eq!(item.last_error_kind, Some(ErrorKind::Interrupted));
    assert_eq!(
        h.manager.get_item(waiting).await.unwrap().status,
        ItemStatus::Pending
    );

    // our own restart says nothing about the source
    let breaker = h.manager.breaker_state("example.com").await;
    assert_eq!(breaker.state, CircuitState::Closed);
    assert_eq!(breaker.failure_count, 0);

    let again = h
        .manager
        .submit("https://example.com/running", "example.com", 0, None)
        .await
        .unwrap();
    assert_eq!(again, SubmissionResult::DuplicateOfActive { item_id: running });

    h.advance_secs(60);
    let batch = h.manager.next_batch(10).await.unwrap();
    let ids: Vec<_> = batch.iter().map(|item| item.item_id).collect();
    assert_eq!(ids, vec![running, waiting]);
}

#[tokio::test]
async fn json_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = exact_config();
    config.store.path = Some(dir.path().join("state").join("queue.json"));
    let clock = Arc::new(FixedClock::new(t0()));

    let (done, gone, queued) = {
        let manager = QueueManager::open(&config, config.item_store(), clock.clone())
            .await
            .unwrap();
        let mut ids = Vec::new();
        for path in ["done", "gone", "queued"] {
            let result = manager
                .submit(&format!("https://example.com/{path}"), "example.com", 0, None)
                .await
                .unwrap();
            ids.push(result.item_id().unwrap());
        }
        manager.next_batch(2).await.unwrap();
        manager
            .report_outcome(ids[0], ProcessOutcome::success())
            .await
            .unwrap();
        manager
            .report_outcome(ids[1], ProcessOutcome::failure(ErrorKind::AuthRefused))
            .await
            .unwrap();
        (ids[0], ids[1], ids[2])
    };
    assert!(config.store.path.as_ref().unwrap().exists());

    let manager = QueueManager::open(&config, config.item_store(), clock.clone())
        .await
        .unwrap();
    let counts = manager.counts_by_status().await;
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.dead_lettered, 1);
    assert_eq!(counts.pending, 1);

    let entries = manager.dead_letters().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].item_id, gone);
    assert_eq!(entries[0].reason_code, ReasonCode::PermanentUpstreamRejection);

    assert_eq!(
        manager
            .submit("https://example.com/done", "example.com", 0, None)
            .await
            .unwrap(),
        SubmissionResult::DuplicateOfCompleted { item_id: done }
    );
    assert_eq!(manager.next_batch(10).await.unwrap()[0].item_id, queued);

    let requeued = manager.requeue_dead_letter(gone).await.unwrap();
    assert!(requeued.is_admitted());
}

#[tokio::test]
async fn quarantined_reference_survives_restart() {
    let config = exact_config();
    let h = Harness::open(config.clone()).await;
    let result = h
        .manager
        .submit("javascript:void(0)", "example.com", 0, None)
        .await
        .unwrap();
    let SubmissionResult::Unprocessable { item_id, .. } = result else {
        panic!("expected quarantine, got {result:?}");
    };

    let h = h.restart(&config).await;
    let again = h
        .manager
        .submit("javascript:void(0)", "example.com", 0, None)
        .await
        .unwrap();
    assert_eq!(
        again,
        SubmissionResult::Unprocessable {
            item_id,
            reason: ReasonCode::UnprocessableScheme
        }
    );
    assert_eq!(h.manager.dead_letters().await.len(), 1);
}

#[tokio::test]
async fn identical_content_under_another_key_completes_as_duplicate() {
    let config = exact_config();
    let h = Harness::open(config.clone()).await;
    let fingerprint = ContentFingerprint::of("the same article body");

    let original = h.admit("https://example.com/post", "example.com", 0).await;
    h.manager.next_batch(1).await.unwrap();
    assert_eq!(
        h.manager
            .mark_content_fingerprint(original, fingerprint.clone())
            .await
            .unwrap(),
        FingerprintResult::Unique
    );
    h.manager
        .report_outcome(original, ProcessOutcome::success())
        .await
        .unwrap();

    let mirror = h.admit("https://mirror.example.org/post", "mirror.example.org", 0).await;
    h.manager.next_batch(1).await.unwrap();
    assert_eq!(
        h.manager
            .mark_content_fingerprint(mirror, fingerprint.clone())
            .await
            .unwrap(),
        FingerprintResult::DuplicateOfCompleted { original }
    );
    let item = h.manager.get_item(mirror).await.unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.duplicate_of, Some(original));

    // the processor's late report is a soft success
    assert_eq!(
        h.manager
            .report_outcome(mirror, ProcessOutcome::success())
            .await
            .unwrap(),
        ReportResult::AlreadyCompleted {
            duplicate_of: Some(original)
        }
    );

    // the index is rebuilt on restart
    let h = h.restart(&config).await;
    let syndicated = h.admit("https://syndicate.example.net/p/1", "syndicate.example.net", 0).await;
    h.manager.next_batch(1).await.unwrap();
    assert_eq!(
        h.manager
            .mark_content_fingerprint(syndicated, fingerprint)
            .await
            .unwrap(),
        FingerprintResult::DuplicateOfCompleted { original }
    );
}

#[tokio::test]
async fn fingerprint_on_terminal_item_is_refused() {
    let h = Harness::open(exact_config()).await;
    let id = h.admit("https://example.com/finished", "example.com", 0).await;
    h.manager.next_batch(1).await.unwrap();
    h.manager
        .report_outcome(id, ProcessOutcome::success())
        .await
        .unwrap();

    let err = h
        .manager
        .mark_content_fingerprint(id, ContentFingerprint::of("late"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SluiceError::NotInFlight {
            status: ItemStatus::Completed,
            ..
        }
    ));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn failed_save_keeps_the_dispatched_batch() {
    let config = exact_config();
    let store = Arc::new(FullDisk::default());
    let clock = Arc::new(FixedClock::new(t0()));
    let manager = QueueManager::open(&config, store.clone(), clock.clone())
        .await
        .unwrap();
    let id = manager
        .submit("https://example.com/a", "example.com", 0, None)
        .await
        .unwrap()
        .item_id()
        .unwrap();

    store.set_full(true);
    let batch = manager.next_batch(5).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].item_id, id);
    assert!(matches!(manager.flush().await, Err(SluiceError::Storage(_))));

    // the worker holding the batch can still report it
    assert_eq!(
        manager
            .report_outcome(id, ProcessOutcome::success())
            .await
            .unwrap(),
        ReportResult::Completed
    );

    store.set_full(false);
    manager.flush().await.unwrap();
    let saves = store.inner.save_count();
    manager.flush().await.unwrap();
    assert_eq!(store.inner.save_count(), saves);

    let reopened = QueueManager::open(&config, store.clone(), clock.clone())
        .await
        .unwrap();
    assert_eq!(
        reopened.get_item(id).await.unwrap().status,
        ItemStatus::Completed
    );
}

#[tokio::test]
async fn unsaved_admission_is_written_by_the_next_change() {
    let config = exact_config();
    let store = Arc::new(FullDisk::default());
    let clock = Arc::new(FixedClock::new(t0()));
    let manager = QueueManager::open(&config, store.clone(), clock.clone())
        .await
        .unwrap();

    store.set_full(true);
    let first = manager
        .submit("https://example.com/first", "example.com", 0, None)
        .await
        .unwrap();
    assert!(first.is_admitted());
    assert_eq!(store.inner.save_count(), 0);

    store.set_full(false);
    manager
        .submit("https://example.com/second", "example.com", 0, None)
        .await
        .unwrap();

    let reopened = QueueManager::open(&config, store.clone(), clock.clone())
        .await
        .unwrap();
    assert_eq!(reopened.counts_by_status().await.pending, 2);
    assert_eq!(
        reopened
            .submit("https://example.com/first", "example.com", 0, None)
            .await
            .unwrap(),
        SubmissionResult::DuplicateOfActive {
            item_id: first.item_id().unwrap()
        }
    );
}
