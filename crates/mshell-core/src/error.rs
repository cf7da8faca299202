//! Error types for the mshell core library.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the mshell core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for mshell operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The well-known rendezvous path could not be created or opened.
    #[error("Rendezvous path {}: {source}", path.display())]
    Rendezvous {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A per-client private path could not be created or opened.
    #[error("Private path {}: {source}", path.display())]
    PrivatePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The peer violated the handshake choreography.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The other side of an in-process transport is gone.
    #[error("Transport closed")]
    TransportClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error belongs to the fatal-to-process class: a
    /// rendezvous or private path could not be created or opened.
    pub const fn is_path_failure(&self) -> bool {
        matches!(self, Self::Rendezvous { .. } | Self::PrivatePath { .. })
    }
}
