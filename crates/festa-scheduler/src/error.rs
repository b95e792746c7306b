use festa_core::types::{EffectId, ItemId, PlayerId};
use festa_store::StoreError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// `start` was called on a scheduler that is already running.
    #[error("{scheduler} scheduler already running")]
    AlreadyRunning { scheduler: &'static str },

    #[error("Effect not found: {id}")]
    EffectNotFound { id: EffectId },

    #[error("Item not found: {id}")]
    ItemNotFound { id: ItemId },

    #[error("Player not found: {id}")]
    PlayerNotFound { id: PlayerId },

    /// The blocking task running a fire transaction panicked or was cancelled.
    #[error("Fire task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
