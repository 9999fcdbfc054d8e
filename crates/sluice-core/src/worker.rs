//! Worker pool - 取得→処理→報告ループ
//!
//! Each worker pulls a batch from the `QueueManager`, hands every item to the
//! `Processor`, and reports the outcome back. The queue decides retry or dead
//! letter; workers never do.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::domain::{ContentFingerprint, ErrorKind, FingerprintResult, ItemId, ProcessOutcome};
use crate::error::Result;
use crate::queue::{QueueItem, QueueManager};

/// The external work done per item (fetch, extract, index...).
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, item: QueueItem, ctx: &ProcessContext) -> ProcessOutcome;
}

/// Handle passed to the processor for the item being processed.
pub struct ProcessContext {
    item_id: ItemId,
    manager: Arc<QueueManager>,
}

impl ProcessContext {
    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// Report the fingerprint of fetched content.
    ///
    /// On `DuplicateOfCompleted` the item is already completed; the processor
    /// should stop and return `Success`.
    pub async fn mark_content_fingerprint(
        &self,
        fingerprint: ContentFingerprint,
    ) -> Result<FingerprintResult> {
        self.manager
            .mark_content_fingerprint(self.item_id, fingerprint)
            .await
    }
}

/// Worker pool handle.
/// - `request_shutdown` で新しいバッチの取得を止める
/// - `shutdown_and_join` で全ワーカーの終了を待てる
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.size` workers.
    pub fn spawn(
        config: &WorkerConfig,
        manager: Arc<QueueManager>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let settings = LoopSettings {
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
            process_timeout: config.process_timeout(),
        };

        let mut joins = Vec::with_capacity(config.size);
        for worker_id in 0..config.size {
            let manager = Arc::clone(&manager);
            let processor = Arc::clone(&processor);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, manager, processor, settings, &mut rx).await;
            });
            joins.push(join);
        }
        info!(workers = config.size, batch_size = settings.batch_size, "worker pool started");

        Self { shutdown_tx, joins }
    }

    /// Stop taking new batches. Items already handed to the processor still
    /// finish and get reported.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

#[derive(Debug, Clone, Copy)]
struct LoopSettings {
    batch_size: usize,
    poll_interval: Duration,
    process_timeout: Option<Duration>,
}

async fn worker_loop(
    worker_id: usize,
    manager: Arc<QueueManager>,
    processor: Arc<dyn Processor>,
    settings: LoopSettings,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let batch = match manager.next_batch(settings.batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(worker_id, error = %e, fatal = e.is_fatal(), "next_batch failed");
                if idle(&manager, settings.poll_interval, shutdown_rx).await {
                    break;
                }
                continue;
            }
        };

        if batch.is_empty() {
            if idle(&manager, settings.poll_interval, shutdown_rx).await {
                break;
            }
            continue;
        }

        // the whole batch is in flight; finish it even if shutdown arrives
        for item in batch {
            let item_id = item.item_id;
            let ctx = ProcessContext {
                item_id,
                manager: Arc::clone(&manager),
            };
            let outcome = run_processor(processor.as_ref(), item, &ctx, settings.process_timeout).await;

            match manager.report_outcome(item_id, outcome).await {
                Ok(result) => debug!(worker_id, %item_id, result = result.label(), "outcome reported"),
                Err(e) => error!(worker_id, %item_id, error = %e, "outcome report failed"),
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

/// Wait for work or a shutdown signal. `true` when the pool handle is gone.
async fn idle(
    manager: &QueueManager,
    poll_interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_err(),
        _ = manager.wait_for_work(poll_interval) => false,
    }
}

async fn run_processor(
    processor: &dyn Processor,
    item: QueueItem,
    ctx: &ProcessContext,
    timeout: Option<Duration>,
) -> ProcessOutcome {
    let Some(limit) = timeout else {
        return processor.process(item, ctx).await;
    };
    match tokio::time::timeout(limit, processor.process(item, ctx)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(item_id = %ctx.item_id, timeout_ms = limit.as_millis() as u64, "processing timed out");
            ProcessOutcome::failure_with(
                ErrorKind::Timeout,
                format!("processing exceeded {}ms", limit.as_millis()),
            )
        }
    }
}
