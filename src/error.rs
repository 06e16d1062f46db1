//! Error types for the key material store

use std::time::Duration;

use thiserror::Error;

/// Result type alias for key material operations
pub type Result<T> = std::result::Result<T, KeyMaterialError>;

/// Errors that can occur while issuing or serving key material
#[derive(Error, Debug)]
pub enum KeyMaterialError {
    /// Caller supplied an invalid argument (e.g. a blank subject)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A command could not be appended to the commit log
    #[error("Publish failure: {0}")]
    PublishFailure(String),

    /// No aggregate update for the subject was observed in time
    #[error("Timed out after {timeout:?} waiting for key material of subject {subject}")]
    AwaitTimeout { subject: String, timeout: Duration },

    /// Stream processing never reached the ready state
    #[error("Startup failure: {0}")]
    StartupFailure(String),

    /// The service has been shut down and accepts no new requests
    #[error("Service stopped")]
    ServiceStopped,

    /// The subject has no committed key material
    #[error("Key material not found for subject {0}")]
    MaterialNotFound(String),

    /// Commit log transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Local table operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for KeyMaterialError {
    fn from(err: serde_json::Error) -> Self {
        KeyMaterialError::Serialization(err.to_string())
    }
}

impl From<figment::Error> for KeyMaterialError {
    fn from(err: figment::Error) -> Self {
        KeyMaterialError::Config(err.to_string())
    }
}
