//! Configuration loaded from TOML.
//!
//! ```toml
//! [store]
//! path = "/var/lib/sluice/state.json"
//!
//! [backpressure]
//! high_water = 5000
//! reject_threshold = 10000
//! min_priority_under_reject = 10
//!
//! [retry.policies.rate_limited]
//! max_attempts = 5
//! backoff_base_secs = 30
//! backoff_multiplier = 2.0
//! ```
//!
//! Every section and field is optional.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::breaker::BreakerConfig;
use crate::classifier::ClassifierConfig;
use crate::error::{Result, SluiceError};
use crate::impls::{JsonFileStore, MemoryStore};
use crate::ports::ItemStore;
use crate::queue::{BackpressureConfig, RetryConfig, RetryPolicies};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub store: StoreConfig,
    pub backpressure: BackpressureConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub classifier: ClassifierConfig,
    pub workers: WorkerConfig,
    /// Priority aging; absent means strict priority order.
    pub aging: Option<AgingConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON state file. Without it state lives in memory only.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub size: usize,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// Processor calls running longer fail with `timeout`.
    pub process_timeout_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            size: 4,
            batch_size: 8,
            poll_interval_ms: 500,
            process_timeout_secs: Some(120),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn process_timeout(&self) -> Option<Duration> {
        self.process_timeout_secs.map(Duration::from_secs)
    }
}

/// Effective priority at dispatch is
/// `priority + min(max_boost, boost * floor(waited / every_secs))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgingConfig {
    pub every_secs: u64,
    pub boost: i32,
    pub max_boost: i32,
}

impl AgingConfig {
    pub fn boost_after(&self, waited: chrono::Duration) -> i32 {
        let waited = waited.num_seconds().max(0) as u64;
        let steps = waited / self.every_secs.max(1);
        let boost = i64::from(self.boost).saturating_mul(i64::try_from(steps).unwrap_or(i64::MAX));
        boost.clamp(0, i64::from(self.max_boost.max(0))) as i32
    }
}

impl SluiceConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: SluiceConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SluiceError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Like `load`, but a missing or broken file falls back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bp = &self.backpressure;
        if bp.reject_threshold < bp.high_water {
            return Err(SluiceError::config(format!(
                "backpressure.reject_threshold ({}) is below high_water ({})",
                bp.reject_threshold, bp.high_water
            )));
        }

        let br = &self.breaker;
        if br.failure_threshold == 0 || br.success_threshold == 0 || br.half_open_max_probes == 0 {
            return Err(SluiceError::config(
                "breaker thresholds and half_open_max_probes must be at least 1",
            ));
        }
        if br.failure_window_secs == 0 {
            return Err(SluiceError::config(
                "breaker.failure_window_secs must be at least 1",
            ));
        }

        if !(0.0..1.0).contains(&self.retry.jitter_fraction) {
            return Err(SluiceError::config(format!(
                "retry.jitter_fraction must be in [0, 1), got {}",
                self.retry.jitter_fraction
            )));
        }
        RetryPolicies::from_config(&self.retry)?;

        if self.workers.size == 0 || self.workers.batch_size == 0 {
            return Err(SluiceError::config("workers.size and workers.batch_size must be at least 1"));
        }

        if let Some(aging) = &self.aging
            && aging.every_secs == 0
        {
            return Err(SluiceError::config("aging.every_secs must be at least 1"));
        }

        Ok(())
    }

    /// Store selected by `store.path`.
    pub fn item_store(&self) -> Arc<dyn ItemStore> {
        match &self.store.path {
            Some(path) => Arc::new(JsonFileStore::new(path)),
            None => Arc::new(MemoryStore::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RetryPolicy;

    #[test]
    fn empty_input_is_all_defaults() {
        let config = SluiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, SluiceConfig::default());
        assert!(config.aging.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let config = SluiceConfig::from_toml_str(
            r#"
            [store]
            path = "state.json"

            [backpressure]
            high_water = 10
            reject_threshold = 20

            [breaker]
            failure_threshold = 3

            [retry]
            jitter_fraction = 0.0

            [retry.policies.rate_limited]
            max_attempts = 3
            backoff_base_secs = 1
            backoff_multiplier = 2.0

            [workers]
            size = 2

            [aging]
            every_secs = 60
            boost = 1
            max_boost = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.store.path, Some(PathBuf::from("state.json")));
        assert_eq!(config.backpressure.reject_threshold, 20);
        assert_eq!(config.backpressure.min_priority_under_reject, 10);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cool_down_secs, 30);
        assert_eq!(
            config.retry.policies.get("rate_limited"),
            Some(&RetryPolicy::new(3, 1, 2.0))
        );
        assert_eq!(config.workers.size, 2);
        assert_eq!(config.workers.batch_size, 8);
        assert_eq!(config.aging.map(|a| a.max_boost), Some(5));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let err = SluiceConfig::from_toml_str(
            "[backpressure]\nhigh_water = 100\nreject_threshold = 10\n",
        )
        .unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));
    }

    #[test]
    fn jitter_must_stay_below_one() {
        let err = SluiceConfig::from_toml_str("[retry]\njitter_fraction = 1.0\n").unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));
    }

    #[test]
    fn zero_workers_are_rejected() {
        let err = SluiceConfig::from_toml_str("[workers]\nsize = 0\n").unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));
    }

    #[test]
    fn zero_failure_window_is_rejected() {
        let err = SluiceConfig::from_toml_str("[breaker]\nfailure_window_secs = 0\n").unwrap_err();
        assert!(matches!(err, SluiceError::Config(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = SluiceConfig::from_toml_str("[store\n").unwrap_err();
        assert!(matches!(err, SluiceError::ConfigParse(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SluiceConfig::load_or_default(dir.path().join("absent.toml"));
        assert_eq!(config, SluiceConfig::default());
    }

    #[test]
    fn aging_boost_is_stepped_and_capped() {
        let aging = AgingConfig {
            every_secs: 60,
            boost: 2,
            max_boost: 5,
        };
        assert_eq!(aging.boost_after(chrono::Duration::seconds(59)), 0);
        assert_eq!(aging.boost_after(chrono::Duration::seconds(60)), 2);
        assert_eq!(aging.boost_after(chrono::Duration::seconds(150)), 4);
        assert_eq!(aging.boost_after(chrono::Duration::hours(10)), 5);
        assert_eq!(aging.boost_after(chrono::Duration::seconds(-5)), 0);
    }
}
