//! Error types surfaced by the call session

use crate::call_engine::MediaError;
use thiserror::Error;

/// Problems with the inputs needed to build a call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Missing call token")]
    MissingToken,

    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("Unsupported base URL scheme: {0}")]
    UnsupportedScheme(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyActive,

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Call session has shut down")]
    SessionClosed,
}
