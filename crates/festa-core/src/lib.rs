//! `festa-core`: configuration, identifiers and domain enums shared by every
//! Festa crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::FestaConfig;
pub use error::{FestaError, Result};
