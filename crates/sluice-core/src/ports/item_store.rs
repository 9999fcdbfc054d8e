//! ItemStore port - 永続化の抽象化
//!
//! The queue keeps its working indexes in memory and writes the item and
//! dead-letter records through this port after every mutation. On start-up the
//! manager loads the last snapshot and rebuilds its indexes from it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::DeadLetterEntry;
use crate::error::Result;
use crate::queue::QueueItem;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Durable state of the queue.
///
/// Breaker state is deliberately not part of it; breakers start closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Next submission sequence number.
    pub next_seq: u64,
    pub items: Vec<QueueItem>,
    pub dead_letters: Vec<DeadLetterEntry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            next_seq: 0,
            items: Vec::new(),
            dead_letters: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Last saved snapshot, or `None` for a fresh store.
    async fn load(&self) -> Result<Option<Snapshot>>;

    /// Replace the stored snapshot. Must be atomic: a crash leaves either the
    /// old or the new snapshot, never a mix.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}
