//! Provider error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur while asking the provider for a turn.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// TCP/HTTP connection to the endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The endpoint did not respond within the configured timeout.
    #[error("provider timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The reply could not be parsed.
    #[error("malformed provider reply: {reason}")]
    MalformedReply { reason: String },

    /// The reply carried neither text nor tool calls.
    #[error("provider returned neither text nor tool calls")]
    EmptyReply,

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl ProviderError {
    /// Extract the error body text, if this is an `HttpError`.
    pub fn error_body(&self) -> Option<&str> {
        match self {
            ProviderError::HttpError { body, .. } => Some(body),
            _ => None,
        }
    }
}
