//! Provider sender abstractions for pushgate.
//!
//! This crate provides the capability traits every provider adapter
//! implements, the [`SenderFactory`] that resolves provider codes to
//! adapters, and the built-in adapters.

pub mod error;
pub mod factory;
pub mod traits;

#[cfg(feature = "zrwinfo")]
pub mod zrwinfo;

#[cfg(feature = "wechat-work")]
pub mod wechat_work;

#[cfg(feature = "dingtalk")]
pub mod dingtalk;

#[cfg(feature = "smtp")]
pub mod smtp;

pub use error::ChannelError;
pub use factory::{ProviderRegistration, SenderFactory};
pub use traits::{
    BatchSendRequest, BatchSender, CallbackHandler, Capabilities, CallbackOutcome, CallbackRequest,
    ProviderReply, SendRequest, SendResponse, Sender, StatusPuller, StatusQuerier,
};

/// Result type for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
