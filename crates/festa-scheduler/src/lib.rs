//! `festa-scheduler`: in-process timers for every time-driven game event.
//!
//! # Overview
//!
//! Three schedulers share one [`registry::TimerRegistry`] design: a map from
//! event key to a Tokio task sleeping until the event is due. The database
//! stays the source of truth; every fire re-reads and re-validates its row
//! inside a `BEGIN IMMEDIATE` transaction, so a stale timer is a no-op.
//!
//! | Scheduler                       | Key                        | Fires at                  | Recurs |
//! |---------------------------------|----------------------------|---------------------------|--------|
//! | [`effects::EffectsScheduler`]   | (player, item, effect)     | `last_executed_at + period` | yes  |
//! | [`contracts::ContractScheduler`]| contract id                | `expires_at`              | no     |
//! | [`debts::DebtScheduler`]        | debt receipt id            | `return_deadline`         | no     |
//!
//! Each scheduler's `start` loads its live rows and arms them, firing
//! anything already overdue straight away; `stop` disarms everything.

pub mod contracts;
pub mod debts;
pub mod effects;
pub mod error;
mod lifecycle;
pub mod registry;
pub mod schedule;

pub use contracts::ContractScheduler;
pub use debts::DebtScheduler;
pub use effects::{EffectKey, EffectsScheduler, GrantedItem};
pub use error::{Result, SchedulerError};
pub use registry::{Rearm, TimerRegistry};
