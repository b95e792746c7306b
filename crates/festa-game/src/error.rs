use festa_scheduler::SchedulerError;
use festa_store::StoreError;
use thiserror::Error;

/// Errors surfaced by game actions. Everything except `Store` and
/// `Scheduler` is a rejected request and leaves the database untouched.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl From<rusqlite::Error> for GameError {
    fn from(e: rusqlite::Error) -> Self {
        GameError::Store(StoreError::from(e))
    }
}

impl GameError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            GameError::NotFound(_) => "NOT_FOUND",
            GameError::Forbidden(_) => "FORBIDDEN",
            GameError::InvalidState(_) => "INVALID_STATE",
            GameError::Validation(_) => "VALIDATION_ERROR",
            GameError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            GameError::Store(_) => "STORE_ERROR",
            GameError::Scheduler(_) => "SCHEDULER_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, GameError>;
