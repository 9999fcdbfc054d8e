//! Queue module: item state machine, retry scheduling, backpressure and the
//! manager that ties them together.

mod backpressure;
mod manager;
mod record;
mod retry;
mod state;

pub use backpressure::{BackpressureConfig, BackpressureLevel};
pub use manager::QueueManager;
pub use record::{NewItem, QueueItem};
pub use retry::{RetryConfig, RetryDecision, RetryPolicies, RetryPolicy, RetryScheduler};
pub use state::ItemStatus;
