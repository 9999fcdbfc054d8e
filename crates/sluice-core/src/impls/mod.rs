//! Impls - ports の実装
//!
//! - **JsonFileStore**: single JSON file, atomic replace on every save
//! - **MemoryStore**: keeps the snapshot in memory (tests, demos, no `store.path`)

pub mod json_store;
pub mod memory_store;

pub use self::json_store::JsonFileStore;
pub use self::memory_store::MemoryStore;
