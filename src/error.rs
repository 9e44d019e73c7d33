//! ==============================================================================
//! error.rs - typed errors for the config store and the cloud transports
//! ==============================================================================
//!
//! the hardware layer and main.rs stay on anyhow. these two enums exist
//! because callers branch on them: the dispatcher treats a rejected value
//! differently from a failed write, and the control loop only stops on a
//! fatal transport error.
//!
//! ==============================================================================

use thiserror::Error;

/// Errors raised by the persisted device configuration.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Value rejected before anything was written
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    /// The backing file could not be read or written
    #[error("config storage error: {0}")]
    Io(#[from] std::io::Error),

    /// A key exists but its value does not parse
    #[error("malformed value for [{section}] {key}: {value:?}")]
    Malformed {
        section: &'static str,
        key: &'static str,
        value: String,
    },

    /// A required key is absent from the document
    #[error("missing [{section}] {key}")]
    Missing {
        section: &'static str,
        key: &'static str,
    },
}

/// Errors raised by the cloud transports.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Protocol accepted by the CLI but not implemented here
    #[error("protocol {0} is not supported by this build")]
    Unsupported(&'static str),

    /// Connection string missing a field or malformed
    #[error("invalid connection string: {0}")]
    ConnectionString(String),

    /// Shared access signature could not be produced
    #[error("credential error: {0}")]
    Credential(String),

    /// MQTT client request could not be queued
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transport's event loop is gone
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Errors that no retry will fix end the control loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::Unsupported(_)
                | TransportError::ConnectionString(_)
                | TransportError::Credential(_)
                | TransportError::Closed
        )
    }
}
