//! `festa-store`: SQLite schema, connection handle and ledger primitives.
//!
//! Every balance or possession change goes through [`ledger`] so the mutating
//! UPDATE and its immutable ledger row are always written by the same
//! transaction. Write transactions are opened with `BEGIN IMMEDIATE` (see
//! [`Store::write`]); SQLite takes the database write lock up front, which is
//! what serialises a timer fire against a manual action on the same row.

pub mod db;
pub mod error;
pub mod ledger;
pub mod store;

pub use error::{Result, StoreError};
pub use store::{format_ts, parse_ts, Store};
