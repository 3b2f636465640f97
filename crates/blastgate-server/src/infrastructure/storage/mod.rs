//! Persistent storage: the TOML config file and the SQLite database.

pub mod config;
pub mod database;

pub use config::{load_config, AppConfig, ConfigError};
pub use database::{Database, RecordedOutcome, ResetOutcome, StoreError};
