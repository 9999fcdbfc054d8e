//! Domain model (ids, error kinds, outcomes, dead-letter records).
//!
//! Plain values only; nothing here touches the queue state or the clock.

pub mod dead_letter;
pub mod errors;
pub mod ids;
pub mod outcome;

pub use dead_letter::{DeadLetterEntry, ReasonCode};
pub use errors::{ErrorKind, UnknownErrorKind};
pub use ids::{CanonicalKey, ContentFingerprint, ItemId};
pub use outcome::{FingerprintResult, ProcessOutcome, ReportResult, SubmissionResult};
