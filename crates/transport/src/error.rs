//! Error types for transport operations.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by every transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind a server endpoint.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Failed to establish an outbound connection.
    #[error("Failed to connect to {addr}: {reason}")]
    Connect {
        /// The address we tried to reach.
        addr: String,
        /// Why the attempt failed.
        reason: String,
    },

    /// The address could not be parsed or resolved.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Generic I/O error on an established connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection before a full frame arrived.
    #[error("Short read: wanted {expected} bytes, got {actual}")]
    ShortRead {
        /// Bytes announced by the frame length prefix.
        expected: usize,
        /// Bytes actually received before end of stream.
        actual: usize,
    },

    /// A frame could not be parsed.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame exceeds the configured size limit.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// More headers than the wire format can carry.
    #[error("Too many headers: {0} (max 255)")]
    TooManyHeaders(usize),

    /// A header key or value does not fit a 16-bit length prefix.
    #[error("Header field of {0} bytes exceeds 65535")]
    HeaderTooLong(usize),

    /// A header cannot be represented by the backend.
    #[error("Invalid header {name:?}: {reason}")]
    InvalidHeader {
        /// Header key.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A one-shot socket was asked to send twice.
    #[error("Response already sent")]
    AlreadySent,

    /// A one-shot socket was asked to receive twice.
    #[error("Request already received")]
    AlreadyReceived,

    /// The connection or stream has ended.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Waiting for a pooled socket took too long.
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// The pool has been shut down.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// The listener has been closed.
    #[error("Listener closed")]
    ListenerClosed,

    /// `accept` was called on a listener that is already accepting.
    #[error("Listener is already accepting")]
    AlreadyAccepting,

    /// The caller's context was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The caller's deadline passed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// gRPC status or channel error.
    #[error("gRPC error: {0}")]
    Grpc(String),

    /// HTTP client or server error.
    #[error("HTTP error: {0}")]
    Http(String),
}

impl TransportError {
    /// Create a connect error for the given address.
    pub fn connect(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a socket that produced this error must not be reused.
    ///
    /// Protocol-state violations leave the underlying connection intact;
    /// everything else may have left a partial frame on the wire.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::AlreadySent
                | Self::AlreadyReceived
                | Self::TooManyHeaders(_)
                | Self::HeaderTooLong(_)
                | Self::InvalidHeader { .. }
        )
    }
}
