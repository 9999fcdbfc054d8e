//! sluice CLI
//!
//! Operator entry point: submit references, inspect the queue, requeue dead
//! letters, and run a dry-run worker pool against the persisted state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sluice_core::impls::MemoryStore;
use sluice_core::ports::SystemClock;
use sluice_core::queue::RetryPolicy;
use sluice_core::{
    BackpressureLevel, ContentFingerprint, ErrorKind, FingerprintResult, ItemId, ProcessContext,
    ProcessOutcome, Processor, QueueCounts, QueueItem, QueueManager, ReasonCode, SluiceConfig,
    SluiceError, WorkerPool, init_tracing, source_key_of,
};
use tracing::{info, warn};

/// sluice - ingestion queue for a personal knowledge pipeline
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about = "Ingestion queue and reliability engine")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = "sluice.toml")]
    config: PathBuf,

    /// State file; overrides `store.path` from the configuration
    #[arg(long)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a reference for ingestion
    Submit {
        reference: String,

        /// Source used for circuit breaking (default: canonical host of the reference)
        #[arg(long)]
        source: Option<String>,

        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,

        /// Declared content type, e.g. `application/pdf`
        #[arg(long)]
        hint: Option<String>,
    },

    /// Item counts by status and the backpressure level
    Status,

    /// List dead letters
    DeadLetters {
        /// Only entries with this reason code (e.g. `retry_budget_exhausted`)
        #[arg(long, value_parser = parse_reason)]
        reason: Option<ReasonCode>,
    },

    /// Delete a dead-letter entry and admit its reference again
    Requeue { item_id: ItemId },

    /// Circuit breaker state per source
    Breakers,

    /// Run the worker pool with a dry-run processor until no active items remain
    Drain,

    /// In-memory walkthrough of retries, circuit breaking and dead letters
    Demo,
}

fn parse_reason(s: &str) -> Result<ReasonCode, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| format!("unknown reason code: {s}"))
}

fn print_json<T: Serialize>(value: &T) -> sluice_core::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct StatusView {
    counts: QueueCounts,
    backpressure: BackpressureLevel,
}

/// Marks content as fetched without fetching anything.
struct DryRunProcessor;

#[async_trait]
impl Processor for DryRunProcessor {
    async fn process(&self, item: QueueItem, ctx: &ProcessContext) -> ProcessOutcome {
        info!(
            item_id = %item.item_id,
            strategy = item.classification.as_str(),
            reference = %item.raw_reference,
            "dry-run processing"
        );
        let fingerprint = ContentFingerprint::of(item.canonical_key.as_str());
        match ctx.mark_content_fingerprint(fingerprint).await {
            Ok(FingerprintResult::Unique) | Ok(FingerprintResult::DuplicateOfCompleted { .. }) => {
                ProcessOutcome::success()
            }
            Err(e) => ProcessOutcome::failure_with(ErrorKind::MalformedContent, e.to_string()),
        }
    }
}

/// Scripted upstreams for `demo`.
struct DemoProcessor;

#[async_trait]
impl Processor for DemoProcessor {
    async fn process(&self, item: QueueItem, _ctx: &ProcessContext) -> ProcessOutcome {
        match item.source_key.as_str() {
            "down.example" => ProcessOutcome::failure_with(ErrorKind::UpstreamUnavailable, "503"),
            _ if item.raw_reference.ends_with("/gone") => {
                ProcessOutcome::failure_with(ErrorKind::ResourceGone, "410")
            }
            _ => ProcessOutcome::success(),
        }
    }
}

/// Run workers until no active items remain or ctrl-c.
async fn drain(config: &SluiceConfig, manager: Arc<QueueManager>, processor: Arc<dyn Processor>) {
    let pool = WorkerPool::spawn(&config.workers, Arc::clone(&manager), processor);
    loop {
        if manager.counts_by_status().await.active() == 0 {
            break;
        }
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "cannot listen for ctrl-c");
                }
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    }
    pool.shutdown_and_join().await;
}

fn demo_config() -> SluiceConfig {
    let mut config = SluiceConfig::default();
    config.retry.jitter_fraction = 0.0;
    for kind in ["upstream_unavailable", "network"] {
        config
            .retry
            .policies
            .insert(kind.to_string(), RetryPolicy::new(2, 0, 1.0));
    }
    config.breaker.failure_threshold = 3;
    config.breaker.cool_down_secs = 1;
    config.workers.poll_interval_ms = 50;
    config
}

async fn demo() -> sluice_core::Result<()> {
    let config = demo_config();
    let manager = Arc::new(
        QueueManager::open(&config, Arc::new(MemoryStore::new()), Arc::new(SystemClock)).await?,
    );

    let submissions = [
        ("https://example.com/articles/1", 5),
        ("https://example.com/articles/1?utm_source=demo", 5),
        ("https://example.com/podcast/episode.mp3", 0),
        ("https://example.com/gone", 0),
        ("mailto:someone@example.com", 0),
        ("https://down.example/a", 1),
        ("https://down.example/b", 1),
        ("https://down.example/c", 1),
    ];
    for (reference, priority) in submissions {
        let result = manager
            .submit(reference, &source_key_of(reference), priority, None)
            .await?;
        info!(reference, result = result.label(), "submitted");
    }

    drain(&config, Arc::clone(&manager), Arc::new(DemoProcessor)).await;

    print_json(&manager.counts_by_status().await)?;
    print_json(&manager.dead_letters().await)?;
    print_json(&manager.breaker_states().await)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), SluiceError> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SluiceConfig::load_or_default(&cli.config);
    if let Some(state) = cli.state {
        config.store.path = Some(state);
    }
    if config.store.path.is_none() {
        warn!("no store.path configured; state will not outlive this command");
    }

    let manager = Arc::new(
        QueueManager::open(&config, config.item_store(), Arc::new(SystemClock)).await?,
    );

    match cli.command {
        Command::Submit {
            reference,
            source,
            priority,
            hint,
        } => {
            let source = source.unwrap_or_else(|| source_key_of(&reference));
            let result = manager
                .submit(&reference, &source, priority, hint.as_deref())
                .await?;
            print_json(&result)?;
        }

        Command::Status => {
            let view = StatusView {
                counts: manager.counts_by_status().await,
                backpressure: manager.backpressure_signal().await,
            };
            print_json(&view)?;
        }

        Command::DeadLetters { reason } => {
            let entries = match reason {
                Some(reason) => manager.dead_letters_by_reason(reason).await,
                None => manager.dead_letters().await,
            };
            print_json(&entries)?;
        }

        Command::Requeue { item_id } => {
            let result = manager.requeue_dead_letter(item_id).await?;
            print_json(&result)?;
        }

        Command::Breakers => {
            print_json(&manager.breaker_states().await)?;
        }

        Command::Drain => {
            drain(&config, Arc::clone(&manager), Arc::new(DryRunProcessor)).await;
            print_json(&manager.counts_by_status().await)?;
        }

        Command::Demo => demo().await?,
    }

    manager.flush().await?;
    Ok(())
}
