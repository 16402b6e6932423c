//! Error types for the network layer.

use rts_core::error::GameError;
use thiserror::Error;

/// Result type alias using [`NetError`].
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors raised by framing, transport and the lockstep roles.
///
/// Everything here is fatal to one connection or one match, never to the
/// process. A lost peer is reported as an event, not an error.
#[derive(Debug, Error)]
pub enum NetError {
    /// The peer speaks another protocol version.
    #[error("Protocol mismatch: expected version {expected}, found {found}")]
    ProtocolMismatch {
        /// Version this build speaks.
        expected: u16,
        /// Version in the received header.
        found: u16,
    },

    /// The header names a message kind this build does not know.
    #[error("Unknown message kind {0}")]
    UnknownMessageKind(u8),

    /// The header sets flags this build does not understand.
    #[error("Unsupported header flags {0:#04x}")]
    UnsupportedFlags(u8),

    /// The payload length exceeds the frame limit.
    #[error("Frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Declared payload length.
        length: u32,
        /// Largest accepted payload.
        max: u32,
    },

    /// The payload does not decode, or decodes to another kind than the header says.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Socket error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// The peer did not finish the handshake in time.
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// The server refused or aborted the session.
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// Server configuration could not be loaded.
    #[error("Failed to load config '{path}': {message}")]
    Config {
        /// Path or label of the config source.
        path: String,
        /// Parser or validation message.
        message: String,
    },

    /// The local simulation failed, including desync detection.
    #[error(transparent)]
    Simulation(#[from] GameError),
}

impl From<bincode::Error> for NetError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
