#![doc = include_str!("../README.md")]

/// Keeper configuration (TOML)
pub mod config;

/// Error (common error types)
pub mod error;

/// Change records, keepers, purging and synchronization bookkeeping
pub mod records;

pub use config::KeeperConfig;
pub use error::{RecordError, Result};
