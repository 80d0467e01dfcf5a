//! Error types for tapnbd.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

// Re-export the protocol error from the nbd crate
pub use nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("nbd protocol error: {0}")]
    Nbd(#[from] NbdError),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot open {name}: {reason}")]
    Open { name: String, reason: &'static str },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Non-blocking socket transport errors. EAGAIN never surfaces here; it is
/// reported as partial progress instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("timed out waiting for the socket")]
    TimedOut,

    #[error("socket error: {0}")]
    Os(#[from] Errno),
}

/// Protocol negotiation errors. Any of these fails `open`.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] NbdError),

    #[error("short read during negotiation: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },
}

/// Enqueue failures reported to the upper block layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// All request slots are in flight; try again after a completion.
    #[error("no free request slots")]
    Busy,

    /// The connection has been disabled; the request was completed with
    /// ETIMEDOUT before this was returned.
    #[error("connection is dead")]
    Dead,

    #[error("buffer is {actual} bytes, request covers {expected}")]
    BufferMismatch { expected: usize, actual: usize },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
