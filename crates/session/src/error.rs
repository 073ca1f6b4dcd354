//! Error types for session operations

/// Errors from credential storage and the refresh endpoint.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("refresh request timed out")]
    Timeout,

    #[error("refresh token rejected: {0}")]
    RefreshRejected(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
