//! Error types for coapflow core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Proxy-Uri missing or not parseable
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// Operation not allowed for this message
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Unknown numeric code
    #[error("unknown code: {0}.{1:02}")]
    UnknownCode(u8, u8),
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidUri(e.to_string())
    }
}
