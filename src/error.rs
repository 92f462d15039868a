//! Error types for the edge bridge

use thiserror::Error;

use crate::codec::CodecError;
use crate::correlator::CorrelationError;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the edge bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (fatal at construction)
    #[error("configuration error: {0}")]
    Config(String),

    /// Device wire protocol error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Session error (unknown device, closed channel, identity mismatch)
    #[error("session error: {0}")]
    Session(String),

    /// Request correlation error
    #[error("correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    /// Platform transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Sub-device store error
    #[error("sub-device store error: {0}")]
    Store(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
