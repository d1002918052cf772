//! # pushgate-dispatch
//!
//! The asynchronous dispatch pipeline: a durable work queue drained by a
//! worker pool, weighted provider selection behind circuit breakers, a
//! failure rule engine with its action executor, and delivery report
//! ingestion with outward status notifications.
//!
//! [`Dispatcher`] wires the pieces together and is the entry point used by
//! the gateway.

pub mod callback;
pub mod circuit;
pub mod db;
pub mod error;
pub mod executor;
pub mod handler;
pub mod notify;
pub mod queue;
pub mod rules;
pub mod selector;
pub mod service;
pub mod status_pull;
pub mod store;
pub mod timeout;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use error::DispatchError;
pub use service::Dispatcher;
pub use store::Stores;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;
