//! Error types for the realtime transport

/// Failures while opening or speaking to the realtime broker.
///
/// None of these reach application code through subscriptions: the
/// connection manager absorbs them into its reconnect state machine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("invalid realtime URL: {0}")]
    InvalidUrl(String),

    #[error("transport connect failed: {0}")]
    Connect(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("broker rejected handshake: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport closed")]
    Closed,
}

/// Result alias for realtime operations.
pub type Result<T> = std::result::Result<T, Error>;
