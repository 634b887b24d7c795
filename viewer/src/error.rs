//! Error type for the viewer control channel.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    /// No viewer executable configured. Fatal at construction.
    #[error("waveform viewer command cannot be unset")]
    NotConfigured,

    #[error("`{command}` not found in PATH")]
    ExecutableNotFound {
        command: String,
        #[source]
        source: which::Error,
    },

    #[error("spawning `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("the waveform viewer is not running")]
    NotRunning,

    /// The viewer's output stream ended while a reply was awaited.
    #[error("viewer output closed before a reply arrived")]
    ChannelClosed,

    #[error("viewer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("viewer did not reply within {0:?}")]
    Timeout(Duration),

    #[error("malformed viewer reply {payload:?}: {source}")]
    MalformedReply {
        payload: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid signal path {0:?}")]
    InvalidSignalPath(String),

    #[error("viewer startup handshake failed: {0}")]
    Handshake(#[source] Box<ViewerError>),
}

pub type Result<T> = std::result::Result<T, ViewerError>;
