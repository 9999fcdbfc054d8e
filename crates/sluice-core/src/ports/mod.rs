//! Ports - 抽象化レイヤー
//!
//! Seams between the queue and the outside world:
//! - `Clock`: every time-dependent decision reads the clock through it
//! - `ItemStore`: durable snapshot of items and dead letters

pub mod clock;
pub mod item_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::item_store::{ItemStore, SNAPSHOT_VERSION, Snapshot};
