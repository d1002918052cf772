//! HTTP gateway for pushgate.
//!
//! This crate provides:
//! - Task submission and lookup
//! - Provider callback ingress
//! - Cache invalidation hooks for the admin layer
//! - Health reporting

pub mod error;
pub mod handlers;
pub mod server;

pub use error::GatewayError;
pub use handlers::ApiResponse;
pub use server::{Gateway, GatewayState};

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
