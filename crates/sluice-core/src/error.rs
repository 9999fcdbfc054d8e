use thiserror::Error;

use crate::domain::ItemId;
use crate::queue::ItemStatus;

pub type Result<T> = std::result::Result<T, SluiceError>;

#[derive(Debug, Error)]
pub enum SluiceError {
    /// The store holds a state that no legal transition could have produced.
    /// The operation was aborted without touching the store.
    #[error("internal inconsistency for {item_id}: {detail}")]
    InternalInconsistency { item_id: ItemId, detail: String },

    #[error("item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("item {item_id} is not in flight (status={status})")]
    NotInFlight { item_id: ItemId, status: ItemStatus },

    #[error("no dead-letter entry for {0}")]
    DeadLetterNotFound(ItemId),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl SluiceError {
    pub fn inconsistency(item_id: ItemId, detail: impl Into<String>) -> Self {
        Self::InternalInconsistency {
            item_id,
            detail: detail.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Bug-class failure rather than a caller or environment problem.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InternalInconsistency { .. })
    }
}
