//! Circuit Breaker Registry - per-source failure gating
//!
//! One breaker per source key (domain or feed id).
//!
//! Failure density: a closed breaker opens once `failure_threshold` failures
//! land within `failure_window_secs` with no success in between. A success
//! while closed clears the window.
//!
//! Every grant from `allow()` is an [`Attempt`]; the caller hands it back
//! with the outcome. Half-open probes are tagged with the half-open phase
//! that granted them, and only those probes move the half-open counters.
//! An attempt let through while closed that reports after the breaker
//! tripped says nothing about the probe run and is ignored.
//!
//! The registry has no lock of its own; the queue manager mutates it under
//! the same mutex as the item store.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub cool_down_secs: u64,
    /// Probes allowed concurrently while half-open.
    pub half_open_max_probes: u32,
    /// Half-open successes needed to close again.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cool_down_secs: 30,
            half_open_max_probes: 1,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only copy of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub source_key: String,
    pub state: CircuitState,
    /// Failures inside the current window (closed) or since opening.
    pub failure_count: u32,
    pub success_count_in_half_open: u32,
    pub probes_in_flight: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// How an attempt was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Granted while the breaker was closed.
    Regular,
    /// Half-open probe from the given half-open phase.
    Probe { phase: u32 },
}

#[derive(Debug, Default)]
struct Breaker {
    state: CircuitState,
    failures: VecDeque<DateTime<Utc>>,
    half_open_successes: u32,
    probes_in_flight: u32,
    opened_at: Option<DateTime<Utc>>,
    /// Bumped on every open -> half-open transition.
    phase: u32,
}

impl Breaker {
    fn owns(&self, attempt: Attempt) -> bool {
        self.state == CircuitState::HalfOpen
            && matches!(attempt, Attempt::Probe { phase } if phase == self.phase)
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: BTreeMap<String, Breaker>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// May an attempt against `source_key` start now?
    ///
    /// Moves an open breaker to half-open once the cool-down has passed, and
    /// reserves a probe slot when half-open. A granted attempt must come back
    /// through `report_outcome` or `release_probe`.
    pub fn allow(&mut self, source_key: &str, now: DateTime<Utc>) -> Option<Attempt> {
        let Some(breaker) = self.breakers.get_mut(source_key) else {
            return Some(Attempt::Regular);
        };

        if breaker.state == CircuitState::Open {
            let cooled = breaker
                .opened_at
                .is_none_or(|at| now >= at + secs(self.config.cool_down_secs));
            if !cooled {
                return None;
            }
            breaker.state = CircuitState::HalfOpen;
            breaker.half_open_successes = 0;
            breaker.probes_in_flight = 0;
            breaker.phase = breaker.phase.wrapping_add(1);
            info!(source_key, state = "half_open", "circuit breaker half-open");
            metrics::record_breaker_transition(CircuitState::HalfOpen.as_str());
        }

        match breaker.state {
            CircuitState::Closed => Some(Attempt::Regular),
            CircuitState::HalfOpen if breaker.probes_in_flight < self.config.half_open_max_probes => {
                breaker.probes_in_flight += 1;
                Some(Attempt::Probe {
                    phase: breaker.phase,
                })
            }
            _ => None,
        }
    }

    /// What `allow` would answer after `reserved` more grants, without
    /// changing anything.
    pub fn would_allow(&self, source_key: &str, now: DateTime<Utc>, reserved: u32) -> bool {
        let Some(breaker) = self.breakers.get(source_key) else {
            return true;
        };
        let probes = match breaker.state {
            CircuitState::Closed => return true,
            CircuitState::HalfOpen => breaker.probes_in_flight,
            CircuitState::Open => {
                let cooled = breaker
                    .opened_at
                    .is_none_or(|at| now >= at + secs(self.config.cool_down_secs));
                if !cooled {
                    return false;
                }
                0
            }
        };
        probes + reserved < self.config.half_open_max_probes
    }

    /// Feed an attempt's outcome into the source's breaker.
    pub fn report_outcome(
        &mut self,
        source_key: &str,
        attempt: Attempt,
        success: bool,
        now: DateTime<Utc>,
    ) {
        let config = &self.config;
        let breaker = self.breakers.entry(source_key.to_string()).or_default();

        match breaker.state {
            CircuitState::Closed if success => breaker.failures.clear(),
            CircuitState::Closed => {
                breaker.failures.push_back(now);
                let horizon = now - secs(config.failure_window_secs);
                while breaker.failures.front().is_some_and(|&at| at <= horizon) {
                    breaker.failures.pop_front();
                }
                if breaker.failures.len() >= config.failure_threshold as usize {
                    trip(breaker, source_key, now);
                }
            }
            CircuitState::HalfOpen if !breaker.owns(attempt) => {
                debug!(source_key, ?attempt, success, "outcome outside the probe run ignored");
            }
            CircuitState::HalfOpen if success => {
                breaker.probes_in_flight = breaker.probes_in_flight.saturating_sub(1);
                breaker.half_open_successes += 1;
                if breaker.half_open_successes >= config.success_threshold {
                    *breaker = Breaker {
                        phase: breaker.phase,
                        ..Breaker::default()
                    };
                    info!(source_key, state = "closed", "circuit breaker closed");
                    metrics::record_breaker_transition(CircuitState::Closed.as_str());
                }
            }
            CircuitState::HalfOpen => {
                breaker.failures.push_back(now);
                trip(breaker, source_key, now);
            }
            // late outcome of an attempt dispatched before the breaker opened
            CircuitState::Open => {}
        }
    }

    /// Give back a half-open probe slot without judging the source.
    pub fn release_probe(&mut self, source_key: &str, attempt: Attempt) {
        if let Some(breaker) = self.breakers.get_mut(source_key)
            && breaker.owns(attempt)
        {
            breaker.probes_in_flight = breaker.probes_in_flight.saturating_sub(1);
        }
    }

    /// Snapshot of one source; unknown sources read as a fresh closed breaker.
    pub fn state(&self, source_key: &str) -> CircuitBreakerState {
        match self.breakers.get(source_key) {
            Some(breaker) => snapshot(source_key, breaker),
            None => snapshot(source_key, &Breaker::default()),
        }
    }

    pub fn states(&self) -> Vec<CircuitBreakerState> {
        self.breakers
            .iter()
            .map(|(key, breaker)| snapshot(key, breaker))
            .collect()
    }
}

fn trip(breaker: &mut Breaker, source_key: &str, now: DateTime<Utc>) {
    breaker.state = CircuitState::Open;
    breaker.opened_at = Some(now);
    breaker.half_open_successes = 0;
    breaker.probes_in_flight = 0;
    warn!(
        source_key,
        failures = breaker.failures.len(),
        state = "open",
        "circuit breaker opened"
    );
    metrics::record_breaker_transition(CircuitState::Open.as_str());
}

fn snapshot(source_key: &str, breaker: &Breaker) -> CircuitBreakerState {
    CircuitBreakerState {
        source_key: source_key.to_string(),
        state: breaker.state,
        failure_count: u32::try_from(breaker.failures.len()).unwrap_or(u32::MAX),
        success_count_in_half_open: breaker.half_open_successes,
        probes_in_flight: breaker.probes_in_flight,
        opened_at: breaker.opened_at,
    }
}

fn secs(n: u64) -> Duration {
    Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX / 1000))
}
