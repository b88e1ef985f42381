//! Domain-specific error types for the streaming pipeline.
//!
//! All fallible operations return `Result<T, StreamError>`.
//! Every failure is scoped to one connection or one message; nothing
//! here is meant to take the process down.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the pixcast pipeline.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The opening HTTP upgrade request was malformed or incomplete.
    #[error("invalid handshake: {0}")]
    InvalidHandshake(&'static str),

    /// The client asked for a WebSocket version we do not speak.
    #[error("unsupported websocket version: {0}")]
    UnsupportedVersion(String),

    /// A frame header could not be parsed.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// A frame or message violated RFC 6455 sequencing rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A frame or reassembled message exceeded the configured limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u64, max: u64 },

    // ── Resource Errors ──────────────────────────────────────────
    /// The client registry is at capacity.
    #[error("client registry full ({0} clients)")]
    RegistryFull(usize),

    /// The connection write lock could not be taken in time.
    #[error("connection writer busy for {0:?}")]
    WriterBusy(Duration),

    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The connection was closed or removed while in use.
    #[error("connection closed")]
    ConnectionClosed,

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    // ── Codec Errors ─────────────────────────────────────────────
    /// permessage-deflate compression or decompression failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Whether this error means the peer is gone (or must be treated
    /// as gone): timeouts, resets, broken pipes, cancellation.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            StreamError::Transport(_) | StreamError::Timeout(_) | StreamError::ConnectionClosed
        )
    }

    /// Whether this error was caused by the peer breaking the protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            StreamError::InvalidHandshake(_)
                | StreamError::UnsupportedVersion(_)
                | StreamError::InvalidFrame(_)
                | StreamError::ProtocolViolation(_)
                | StreamError::MessageTooLarge { .. }
        )
    }
}

// ── CodecError ────────────────────────────────────────────────────

/// Failure inside the raw-deflate streams.
///
/// Never fatal to a connection on the send side: the caller falls
/// back to the uncompressed payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The deflate stream rejected input.
    #[error("deflate failed: {0}")]
    Compress(String),

    /// The inflate stream rejected input (corrupt or truncated data).
    #[error("inflate failed: {0}")]
    Decompress(String),

    /// Inflated output grew past the allowed size.
    #[error("inflated payload exceeds {0} bytes")]
    OutputLimit(usize),
}

impl From<flate2::CompressError> for CodecError {
    fn from(e: flate2::CompressError) -> Self {
        CodecError::Compress(e.to_string())
    }
}

impl From<flate2::DecompressError> for CodecError {
    fn from(e: flate2::DecompressError) -> Self {
        CodecError::Decompress(e.to_string())
    }
}

// ── Dropped ───────────────────────────────────────────────────────

/// Returned by the scheduler when a message could not be queued
/// within the configured wait bound.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("message dropped: transmission queue full")]
pub struct Dropped;

// ── Convenient From implementations ──────────────────────────────

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(s)
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StreamError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        StreamError::ChannelClosed
    }
}
