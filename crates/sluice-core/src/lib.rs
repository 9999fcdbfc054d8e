//! sluice-core
//!
//! Ingestion queue and reliability engine for a personal knowledge pipeline.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, error kinds, outcomes, dead-letter records）
//! - **classifier**: 参照の分類（article / podcast / feed / document / unprocessable）
//! - **dedup**: 正規化キーと内容フィンガープリントによる重複排除
//! - **breaker**: ソース単位のサーキットブレーカー
//! - **queue**: 状態機械、リトライ、バックプレッシャー、`QueueManager`
//! - **worker**: `Processor` を駆動するワーカープール
//! - **ports**: 抽象化レイヤー（ItemStore, Clock）
//! - **impls**: ports の実装（JSON ファイル、メモリ）
//! - **config / observability / metrics**: 設定、ログ、メトリクス

pub mod breaker;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod error;
pub mod impls;
pub mod metrics;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod worker;

pub use breaker::{Attempt, BreakerConfig, CircuitBreakerRegistry, CircuitBreakerState, CircuitState};
pub use classifier::{ClassificationResult, Classifier, ClassifierConfig, Strategy};
pub use config::SluiceConfig;
pub use dedup::{canonicalize, source_key_of};
pub use domain::{
    CanonicalKey, ContentFingerprint, DeadLetterEntry, ErrorKind, FingerprintResult, ItemId,
    ProcessOutcome, ReasonCode, ReportResult, SubmissionResult,
};
pub use error::{Result, SluiceError};
pub use observability::{QueueCounts, init_tracing};
pub use queue::{BackpressureLevel, ItemStatus, QueueItem, QueueManager};
pub use worker::{ProcessContext, Processor, WorkerPool};
