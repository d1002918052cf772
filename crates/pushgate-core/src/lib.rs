//! # pushgate-core
//!
//! Core types, configuration, and utilities for pushgate.
//!
//! This crate provides shared functionality used across all pushgate crates:
//!
//! - **Configuration**: Loading, validation, and persistence of the JSON5 config file
//! - **Types**: Tasks, failure rules, provider records, callback results and audit logs
//! - **Utilities**: ID generation and secret handling

pub mod config;
pub mod error;
pub mod id;
pub mod secret;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use error::{Error, Result};
pub use secret::SecretString;
pub use types::*;
