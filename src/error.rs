//! Error types for Braid.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for Braid operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Braid.
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection timeout")]
    ConnectionTimeout,

    // Protocol errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Multipath errors
    #[error("no available paths")]
    NoAvailablePaths,

    #[error("path {0} not found")]
    PathNotFound(String),

    #[error("all paths failed")]
    AllPathsFailed,

    #[error("send deadline exceeded")]
    SendDeadline,

    // FEC errors
    #[error("FEC error: {0}")]
    Fec(String),

    // Stripe authentication
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("replayed sequence number {0}")]
    Replay(u64),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Shutdown
    #[error("cancelled")]
    Cancelled,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("QUIC error: {0}")]
    Quic(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("MTU exceeded: packet size {size}, max {max}")]
    MtuExceeded { size: usize, max: usize },
}

/// Protocol parsing and handling errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("invalid stripe header")]
    InvalidStripeHeader,

    #[error("invalid version: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("session not found: {0:08x}")]
    SessionNotFound(u32),
}

impl Error {
    /// Check if error is a transient path failure (mark down, retry on the
    /// next path) rather than a fatal condition.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout
                | Error::ConnectionClosed
                | Error::Transport(
                    TransportError::SendFailed(_) | TransportError::ReceiveFailed(_)
                )
                | Error::Io(_)
        )
    }

    /// Check if the error was caused by shutdown; such errors are swallowed
    /// instead of triggering reconnects.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
