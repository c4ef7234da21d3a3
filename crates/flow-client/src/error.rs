//! Error types for the HTTP backend

use flow_core::FlowError;
use thiserror::Error;

/// Errors raised while talking to the orchestrator
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure (connect, timeout, TLS)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("API error {status}: {body}")]
    Status { status: u16, body: String },

    /// The body could not be decoded into the expected type
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// The client could not be constructed
    #[error("Invalid client configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(e) => e.is_timeout() || e.is_connect(),
            ClientError::Status { status, .. } => *status >= 500 || *status == 429,
            ClientError::Decode(_) | ClientError::Config(_) => false,
        }
    }
}

impl From<ClientError> for FlowError {
    fn from(error: ClientError) -> Self {
        FlowError::backend(error.to_string())
    }
}
