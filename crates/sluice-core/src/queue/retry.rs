//! Retry scheduler: error kind -> policy -> backoff or give up.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::domain::{ErrorKind, ReasonCode};
use crate::error::{Result, SluiceError};

/// Retry policy for one error kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before giving up. Zero means never retry.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub backoff_base_secs: u64,

    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub const NEVER: RetryPolicy = RetryPolicy {
        max_attempts: 0,
        backoff_base_secs: 0,
        backoff_multiplier: 1.0,
    };

    pub fn new(max_attempts: u32, backoff_base_secs: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            backoff_base_secs,
            backoff_multiplier,
        }
    }

    /// Un-jittered delay after `attempt_count` earlier failures:
    /// `min(base * multiplier^attempt_count, max_delay)`.
    ///
    /// Example with base=1s, multiplier=2.0:
    /// - first failure (attempt_count 0): 1s
    /// - second: 2s
    /// - third: 4s
    pub fn backoff(&self, attempt_count: u32, max_delay: Duration) -> Duration {
        let exponent = i32::try_from(attempt_count).unwrap_or(i32::MAX);
        let secs = self.backoff_base_secs as f64 * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(max_delay)
    }
}

/// `retry` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_delay_secs: u64,

    /// Jitter is drawn from `[0, delay * jitter_fraction)`.
    pub jitter_fraction: f64,

    /// Per-kind overrides keyed by error kind name (`rate_limited`, ...).
    pub policies: BTreeMap<String, RetryPolicy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_delay_secs: 3600,
            jitter_fraction: 0.2,
            policies: BTreeMap::new(),
        }
    }
}

/// The error-kind to policy table.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicies {
    policies: BTreeMap<ErrorKind, RetryPolicy>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        let transient = RetryPolicy::new(3, 5, 2.0);
        let policies = ErrorKind::ALL
            .iter()
            .map(|&kind| {
                let policy = match kind {
                    ErrorKind::RateLimited => RetryPolicy::new(5, 30, 2.0),
                    k if k.is_transient() => transient,
                    _ => RetryPolicy::NEVER,
                };
                (kind, policy)
            })
            .collect();
        Self { policies }
    }
}

impl RetryPolicies {
    /// Defaults with the configured overrides applied.
    ///
    /// Permanent kinds cannot be made retryable.
    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        let mut table = Self::default();
        for (name, policy) in &config.policies {
            let kind: ErrorKind = name
                .parse()
                .map_err(|e| SluiceError::config(format!("retry.policies: {e}")))?;
            if !kind.is_transient() {
                return Err(SluiceError::config(format!(
                    "retry.policies: {kind} is permanent and never retried"
                )));
            }
            if policy.backoff_multiplier < 1.0 {
                return Err(SluiceError::config(format!(
                    "retry.policies.{kind}: backoff_multiplier must be >= 1"
                )));
            }
            table.policies.insert(kind, *policy);
        }
        Ok(table)
    }

    pub fn with(mut self, kind: ErrorKind, policy: RetryPolicy) -> Self {
        self.policies.insert(kind, policy);
        self
    }

    /// Pure function of the error kind.
    pub fn policy_for(&self, kind: ErrorKind) -> RetryPolicy {
        if !kind.is_transient() {
            return RetryPolicy::NEVER;
        }
        self.policies.get(&kind).copied().unwrap_or(RetryPolicy::NEVER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        next_eligible_at: DateTime<Utc>,
        delay: Duration,
    },
    GiveUp {
        reason: ReasonCode,
    },
}

#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policies: RetryPolicies,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl RetryScheduler {
    pub fn new(policies: RetryPolicies, max_delay: Duration, jitter_fraction: f64) -> Self {
        Self {
            policies,
            max_delay,
            jitter_fraction: jitter_fraction.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Result<Self> {
        Ok(Self::new(
            RetryPolicies::from_config(config)?,
            Duration::from_secs(config.max_delay_secs),
            config.jitter_fraction,
        ))
    }

    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    /// Decide what happens after a failure.
    ///
    /// `attempt_count` is the number of failures reported *before* this one.
    pub fn schedule_retry(
        &self,
        attempt_count: u32,
        kind: ErrorKind,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !kind.is_transient() {
            return RetryDecision::GiveUp {
                reason: ReasonCode::PermanentUpstreamRejection,
            };
        }

        let policy = self.policies.policy_for(kind);
        if attempt_count >= policy.max_attempts {
            return RetryDecision::GiveUp {
                reason: ReasonCode::RetryBudgetExhausted,
            };
        }

        let delay = policy.backoff(attempt_count, self.max_delay) + self.jitter(policy, attempt_count);
        let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let next_eligible_at = now
            .checked_add_signed(chrono::Duration::milliseconds(millis))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Retry {
            next_eligible_at,
            delay,
        }
    }

    fn jitter(&self, policy: RetryPolicy, attempt_count: u32) -> Duration {
        let span = policy.backoff(attempt_count, self.max_delay).as_secs_f64() * self.jitter_fraction;
        if span <= 0.0 {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(0.0..span);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn no_jitter() -> RetryScheduler {
        RetryScheduler::new(RetryPolicies::default(), Duration::from_secs(3600), 0.0)
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::new(3, 1, 2.0);
        let max = Duration::from_secs(3600);

        assert_eq!(policy.backoff(0, max), Duration::from_secs(1));
        assert_eq!(policy.backoff(1, max), Duration::from_secs(2));
        assert_eq!(policy.backoff(2, max), Duration::from_secs(4));
    }

    #[test]
    fn backoff_is_capped_by_max_delay() {
        let policy = RetryPolicy::new(100, 30, 2.0);
        let max = Duration::from_secs(600);
        assert_eq!(policy.backoff(10, max), max);
        assert_eq!(policy.backoff(u32::MAX, max), max);
    }

    #[rstest]
    #[case(ErrorKind::ResourceGone)]
    #[case(ErrorKind::AuthRefused)]
    #[case(ErrorKind::UnsupportedContent)]
    #[case(ErrorKind::MalformedContent)]
    fn permanent_kinds_give_up_immediately(#[case] kind: ErrorKind) {
        assert_eq!(
            no_jitter().schedule_retry(0, kind, t0()),
            RetryDecision::GiveUp {
                reason: ReasonCode::PermanentUpstreamRejection
            }
        );
    }

    #[test]
    fn gives_up_once_budget_is_spent() {
        let scheduler = RetryScheduler::new(
            RetryPolicies::default().with(ErrorKind::RateLimited, RetryPolicy::new(3, 1, 2.0)),
            Duration::from_secs(3600),
            0.0,
        );

        let delays: Vec<_> = (0..3)
            .map(|n| match scheduler.schedule_retry(n, ErrorKind::RateLimited, t0()) {
                RetryDecision::Retry { delay, .. } => delay,
                other => panic!("expected retry, got {other:?}"),
            })
            .collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );

        assert_eq!(
            scheduler.schedule_retry(3, ErrorKind::RateLimited, t0()),
            RetryDecision::GiveUp {
                reason: ReasonCode::RetryBudgetExhausted
            }
        );
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let scheduler = RetryScheduler::new(RetryPolicies::default(), Duration::from_secs(3600), 0.5);
        for _ in 0..50 {
            let RetryDecision::Retry { delay, .. } = scheduler.schedule_retry(0, ErrorKind::Network, t0())
            else {
                panic!("network errors retry");
            };
            assert!(delay >= Duration::from_secs(5));
            assert!(delay < Duration::from_millis(7500));
        }
    }

    #[test]
    fn next_eligible_at_is_now_plus_delay() {
        let RetryDecision::Retry {
            next_eligible_at, ..
        } = no_jitter().schedule_retry(1, ErrorKind::Timeout, t0())
        else {
            panic!("timeouts retry");
        };
        assert_eq!(next_eligible_at, t0() + chrono::Duration::seconds(10));
    }

    #[test]
    fn rate_limits_get_longer_backoff_and_more_attempts() {
        let policies = RetryPolicies::default();
        let limited = policies.policy_for(ErrorKind::RateLimited);
        let network = policies.policy_for(ErrorKind::Network);
        assert!(limited.max_attempts > network.max_attempts);
        assert!(limited.backoff_base_secs > network.backoff_base_secs);
        assert_eq!(policies.policy_for(ErrorKind::ResourceGone), RetryPolicy::NEVER);
    }

    #[test]
    fn config_overrides_apply_by_kind_name() {
        let mut config = RetryConfig::default();
        config
            .policies
            .insert("timeout".to_string(), RetryPolicy::new(7, 2, 3.0));
        let policies = RetryPolicies::from_config(&config).unwrap();
        assert_eq!(policies.policy_for(ErrorKind::Timeout), RetryPolicy::new(7, 2, 3.0));
    }

    #[rstest]
    #[case("not_a_kind", RetryPolicy::new(1, 1, 2.0))]
    #[case("resource_gone", RetryPolicy::new(1, 1, 2.0))]
    #[case("network", RetryPolicy::new(1, 1, 0.5))]
    fn bad_overrides_are_rejected(#[case] name: &str, #[case] policy: RetryPolicy) {
        let mut config = RetryConfig::default();
        config.policies.insert(name.to_string(), policy);
        assert!(matches!(
            RetryPolicies::from_config(&config),
            Err(SluiceError::Config(_))
        ));
    }
}
