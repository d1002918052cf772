//! Channel error types.

use thiserror::Error;

/// Errors that can occur while talking to a provider.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No provider registered under this code.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// The provider does not declare the requested capability.
    #[error("Provider {provider} does not support {capability}")]
    Unsupported {
        /// Provider code.
        provider: String,
        /// Capability name.
        capability: &'static str,
    },

    /// Missing or invalid account configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication against the provider failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider returned an error envelope.
    #[error("Provider error ({provider}): {code} {message}")]
    Provider {
        /// Provider code.
        provider: String,
        /// Provider error code.
        code: String,
        /// Provider error message.
        message: String,
    },

    /// Callback payload could not be parsed.
    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    /// Timeout error.
    #[error("Operation timed out")]
    Timeout,
}

impl ChannelError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an unsupported capability error.
    pub fn unsupported(provider: impl Into<String>, capability: &'static str) -> Self {
        Self::Unsupported {
            provider: provider.into(),
            capability,
        }
    }

    /// Create a provider error.
    pub fn provider(
        provider: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the error happened before any provider interaction was possible.
    ///
    /// These errors carry no provider signal for rule matching.
    pub fn is_pre_send(&self) -> bool {
        matches!(
            self,
            Self::UnknownProvider(_) | Self::Unsupported { .. } | Self::Config(_)
        )
    }

    /// Check if this error is retriable.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
