//! `festa-game`: game actions and the game timeline, wired to the timer
//! engines in `festa-scheduler`.
//!
//! The action modules ([`contracts`], [`debts`], [`items`], [`timeline`])
//! hold the transactional rules and run inside a caller-supplied write
//! transaction. [`GameService`] owns the store and the three schedulers and
//! arms or disarms timers once a transaction has committed.

pub mod contracts;
pub mod debts;
mod deadline;
pub mod error;
pub mod items;
pub mod service;
pub mod timeline;

pub use error::{GameError, Result};
pub use service::{GameService, GameStatus, SchedulerStatus};
