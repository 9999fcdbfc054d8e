//! Logging setup and status views.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::queue::ItemStatus;

/// Install the global subscriber. Binaries call this once; the library never does.
///
/// `RUST_LOG` filters (default `info`); `LOG_FORMAT=json` switches to JSON lines.
/// A second call is a no-op.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };
    // already installed (tests, embedding binaries)
    let _ = result;
}

/// Item counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub retry_scheduled: usize,
    pub dead_lettered: usize,
}

impl QueueCounts {
    pub fn add(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Pending => self.pending += 1,
            ItemStatus::InFlight => self.in_flight += 1,
            ItemStatus::Completed => self.completed += 1,
            ItemStatus::RetryScheduled => self.retry_scheduled += 1,
            ItemStatus::DeadLettered => self.dead_lettered += 1,
        }
    }

    /// Items occupying queue capacity.
    pub fn active(&self) -> usize {
        self.pending + self.in_flight + self.retry_scheduled
    }

    pub fn total(&self) -> usize {
        self.active() + self.completed + self.dead_lettered
    }
}

impl FromIterator<ItemStatus> for QueueCounts {
    fn from_iter<I: IntoIterator<Item = ItemStatus>>(iter: I) -> Self {
        let mut counts = QueueCounts::default();
        for status in iter {
            counts.add(status);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_excludes_terminal_states() {
        let counts: QueueCounts = [
            ItemStatus::Pending,
            ItemStatus::InFlight,
            ItemStatus::RetryScheduled,
            ItemStatus::Completed,
            ItemStatus::DeadLettered,
            ItemStatus::DeadLettered,
        ]
        .into_iter()
        .collect();

        assert_eq!(counts.active(), 3);
        assert_eq!(counts.dead_lettered, 2);
        assert_eq!(counts.total(), 6);
    }

    #[test]
    fn init_tracing_twice_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
