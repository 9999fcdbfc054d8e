#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sluice_core::impls::MemoryStore;
use sluice_core::ports::FixedClock;
use sluice_core::{ItemId, QueueManager, SluiceConfig, SubmissionResult};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// Defaults without jitter, so backoff times are exact.
pub fn exact_config() -> SluiceConfig {
    let mut config = SluiceConfig::default();
    config.retry.jitter_fraction = 0.0;
    config
}

pub struct Harness {
    pub manager: Arc<QueueManager>,
    pub clock: Arc<FixedClock>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub async fn open(config: SluiceConfig) -> Self {
        let clock = Arc::new(FixedClock::new(t0()));
        let store = Arc::new(MemoryStore::new());
        let manager = QueueManager::open(&config, store.clone(), clock.clone())
            .await
            .unwrap();
        Self {
            manager: Arc::new(manager),
            clock,
            store,
        }
    }

    /// A fresh manager over the same store and clock.
    pub async fn restart(&self, config: &SluiceConfig) -> Self {
        let manager = QueueManager::open(config, self.store.clone(), self.clock.clone())
            .await
            .unwrap();
        Self {
            manager: Arc::new(manager),
            clock: self.clock.clone(),
            store: self.store.clone(),
        }
    }

    pub async fn admit(&self, reference: &str, source_key: &str, priority: i32) -> ItemId {
        match self
            .manager
            .submit(reference, source_key, priority, None)
            .await
            .unwrap()
        {
            SubmissionResult::Admitted { item_id } => item_id,
            other => panic!("expected admission of {reference}, got {other:?}"),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}
