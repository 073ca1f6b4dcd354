//! Classified request errors
//!
//! Every failed call surfaces as one `ApiError`, built once at the boundary
//! from whatever the backend (or the network) gave us and never mutated
//! afterwards. The `kind` drives UI copy; `message` is the backend's own text
//! when it sent one, otherwise a fixed fallback for the kind.

use serde::{Deserialize, Serialize};

/// Machine-readable codes attached by the client itself.
pub mod codes {
    /// No response was received.
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    /// The call exceeded its timeout.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// 403 caused by a missing or stale CSRF token.
    pub const CSRF_ERROR: &str = "CSRF_ERROR";
    /// 401 whose refresh attempt failed.
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    /// The payload did not match the expected shape.
    pub const DECODE_ERROR: &str = "DECODE_ERROR";
}

const NETWORK_FALLBACK: &str =
    "Unable to reach the server. Please check your connection and try again.";
const SERVER_FALLBACK: &str = "The server encountered a problem. Please try again later.";
const AUTHENTICATION_FALLBACK: &str = "Your session has expired. Please log in again.";
const AUTHORIZATION_FALLBACK: &str = "You do not have permission to perform this action.";
const VALIDATION_FALLBACK: &str = "The request could not be processed. Please check your input.";
const UNKNOWN_FALLBACK: &str = "An unexpected error occurred. Please try again.";

/// Phrases that mark an authentication failure as an expired session rather
/// than a bad login.
const EXPIRY_PATTERNS: &[&str] = &["expired", "session", "jwt", "token"];

/// Phrases that mark an authentication failure as bad credentials.
const BAD_CREDENTIAL_PATTERNS: &[&str] = &[
    "bad credentials",
    "invalid credentials",
    "invalid email or password",
    "incorrect password",
];

/// Error taxonomy shared by every layer above the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// 4xx business or input errors
    Validation,
    /// 401
    Authentication,
    /// 403, including CSRF
    Authorization,
    /// No response received
    Network,
    /// 5xx
    Server,
    Unknown,
}

impl ErrorKind {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            400..=499 => ErrorKind::Validation,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::Unknown => "unknown",
        }
    }

    fn fallback_message(&self) -> &'static str {
        match self {
            ErrorKind::Validation => VALIDATION_FALLBACK,
            ErrorKind::Authentication => AUTHENTICATION_FALLBACK,
            ErrorKind::Authorization => AUTHORIZATION_FALLBACK,
            ErrorKind::Network => NETWORK_FALLBACK,
            ErrorKind::Server => SERVER_FALLBACK,
            ErrorKind::Unknown => UNKNOWN_FALLBACK,
        }
    }
}

/// Backend error envelope:
/// `{"timestamp","status","error","message","path","validationErrors"?}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    timestamp: Option<serde_json::Value>,
    error: Option<String>,
    #[serde(alias = "code")]
    error_code: Option<String>,
    message: Option<String>,
    path: Option<String>,
    #[serde(alias = "errors")]
    validation_errors: Option<serde_json::Value>,
}

/// A failed call, normalized from either backend envelope or a transport failure.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{message}")]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub kind: ErrorKind,
    /// Human-readable text, from the backend when available.
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub validation_errors: Option<serde_json::Value>,
    pub path: Option<String>,
    pub timestamp: Option<String>,
}

impl ApiError {
    /// Build from a non-2xx response body.
    ///
    /// `request_path` is used when the backend did not echo a `path`.
    pub fn from_response(status: u16, body: &str, request_path: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
        let kind = ErrorKind::from_status(status);

        let message = parsed
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| kind.fallback_message().to_string());

        let code = if kind == ErrorKind::Authorization && mentions_csrf(&message) {
            Some(codes::CSRF_ERROR.to_string())
        } else {
            parsed.error_code.or(parsed.error)
        };

        let timestamp = parsed.timestamp.map(|t| match t {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });

        Self {
            kind,
            message,
            status: Some(status),
            code,
            validation_errors: parsed.validation_errors,
            path: Some(parsed.path.unwrap_or_else(|| request_path.to_string())),
            timestamp,
        }
    }

    /// Build from a transport failure (no response received).
    pub fn network(error: &reqwest::Error, request_path: &str) -> Self {
        let code = if error.is_timeout() {
            codes::TIMEOUT
        } else {
            codes::NETWORK_ERROR
        };
        Self {
            kind: ErrorKind::Network,
            message: NETWORK_FALLBACK.to_string(),
            status: None,
            code: Some(code.to_string()),
            validation_errors: None,
            path: Some(request_path.to_string()),
            timestamp: None,
        }
    }

    /// Business error signalled inside a 2xx `{data: null, message, error}` envelope.
    pub fn business(code: String, message: Option<String>, status: u16, request_path: &str) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| VALIDATION_FALLBACK.to_string()),
            status: Some(status),
            code: Some(code),
            validation_errors: None,
            path: Some(request_path.to_string()),
            timestamp: None,
        }
    }

    /// Payload did not match the type the caller asked for.
    pub fn decode(detail: impl std::fmt::Display, request_path: Option<&str>) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            message: format!("unexpected response payload: {detail}"),
            status: None,
            code: Some(codes::DECODE_ERROR.to_string()),
            validation_errors: None,
            path: request_path.map(str::to_string),
            timestamp: None,
        }
    }

    pub fn is_csrf(&self) -> bool {
        self.code.as_deref() == Some(codes::CSRF_ERROR)
    }

    /// Whether the message or code reads as an expired session (as opposed to
    /// a rejected login).
    pub fn is_session_expiry(&self) -> bool {
        if self.code.as_deref() == Some(codes::SESSION_EXPIRED) {
            return true;
        }
        let text = format!(
            "{} {}",
            self.message.to_lowercase(),
            self.code.as_deref().unwrap_or("").to_lowercase()
        );
        if BAD_CREDENTIAL_PATTERNS.iter().any(|p| text.contains(p)) {
            return false;
        }
        EXPIRY_PATTERNS.iter().any(|p| text.contains(p))
    }

    /// Forced logout applies only to authentication errors that signal expiry.
    pub fn should_force_logout(&self) -> bool {
        self.kind == ErrorKind::Authentication && self.is_session_expiry()
    }
}

fn mentions_csrf(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("csrf") || lower.contains("xsrf")
}

/// Errors from building an `ApiClient`.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}
