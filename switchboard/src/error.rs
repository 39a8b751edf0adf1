//! Unified error types for switchboard.
//!
//! Every layer has its own error enum; all of them convert into the main
//! [`BotError`] so the host binary can report any failure uniformly.

use std::fmt;

// ============================================================================
// Main Error Type
// ============================================================================

/// The main error type for switchboard operations.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// Socket-level failure.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Malformed wire data or rejected handshake.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// Protocol client failure.
    #[error("client: {0}")]
    Client(#[from] ClientError),

    /// Command handler failure.
    #[error("handler: {0}")]
    Handler(#[from] HandlerError),

    /// Command queue rejection.
    #[error("dispatch: {0}")]
    Dispatch(#[from] DispatchError),

    /// Configuration error.
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// Bootstrap storage error.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl BotError {
    /// Create a config error from a string.
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(ConfigError::Invalid(msg.into()))
    }
}

/// Result type alias for switchboard operations.
pub type Result<T> = std::result::Result<T, BotError>;

// ============================================================================
// Transport Errors
// ============================================================================

/// Error type for the duplex socket layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed {
        /// Remote address.
        addr: String,
        /// Underlying cause.
        reason: String,
    },

    /// A write did not complete.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A read did not complete.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The socket is already shut down.
    #[error("transport closed")]
    Closed,
}

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

// ============================================================================
// Protocol Errors
// ============================================================================

/// A single malformed line or frame. Never fatal to the stream.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A line could not be parsed.
    #[error("malformed line: {0}")]
    MalformedLine(String),

    /// A line ran past the length limit before its terminator.
    #[error("line too long: {actual} bytes (limit {limit})")]
    LineTooLong {
        /// Bytes seen so far.
        actual: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A frame could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// JSON decoding error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote side refused the handshake.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// Reading the byte stream failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Create a malformed frame error.
    #[inline]
    pub fn frame(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}

/// Result type for protocol parsing.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

// ============================================================================
// Client Errors
// ============================================================================

/// Error type for protocol client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// HTTP handshake or REST failure.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// A connect attempt is already running.
    #[error("connect already in progress")]
    AlreadyConnecting,

    /// The client has no live connection.
    #[error("not connected")]
    NotConnected,

    /// The operation does not exist on this protocol.
    #[error("unsupported on this protocol: {0}")]
    Unsupported(&'static str),

    /// The client configuration is unusable.
    #[error("config: {0}")]
    Config(String),
}

/// Result type for protocol client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Handler / Dispatch Errors
// ============================================================================

/// Failure inside a built-in or plugin command handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler returned an error.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Arguments were missing or invalid.
    #[error("usage: {0}")]
    Usage(String),
}

impl HandlerError {
    /// Create a failure error.
    #[inline]
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Create a usage error.
    #[inline]
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }
}

/// Result type for command handlers.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Error type for the command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Commands must carry request text.
    #[error("command request text is empty")]
    EmptyRequest,
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Error type for configuration operations. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Storage error while reading the file.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// JSON parsing error.
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),

    /// Missing required field.
    #[error("missing: {0}")]
    Missing(String),

    /// Invalid value.
    #[error("invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Create a missing field error.
    #[inline]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::Missing(field.into())
    }

    /// Create an invalid value error.
    #[inline]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// ============================================================================
// Storage Errors
// ============================================================================

/// Error type for the bootstrap storage handler.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// IO error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Item not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Create a not found error.
    #[inline]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ============================================================================
// Display Helpers
// ============================================================================

/// A wrapper that displays errors in a user-friendly format.
#[derive(Debug)]
pub struct DisplayError<'a>(pub &'a BotError);

impl fmt::Display for DisplayError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            BotError::Transport(e) => write!(f, "Connection error: {e}"),
            BotError::Protocol(e) => write!(f, "Protocol error: {e}"),
            BotError::Client(e) => write!(f, "Client error: {e}"),
            BotError::Handler(e) => write!(f, "Command error: {e}"),
            BotError::Dispatch(e) => write!(f, "Dispatch error: {e}"),
            BotError::Config(e) => write!(f, "Configuration error: {e}"),
            BotError::Storage(e) => write!(f, "Storage error: {e}"),
            BotError::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}
