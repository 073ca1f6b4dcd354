//! Session refresh against the backend's refresh endpoint
//!
//! The refresh call is made on a bare `reqwest::Client` that shares the
//! pipeline's cookie jar but none of its request handling, so a failing
//! refresh can never re-enter the 401 path that triggered it.
//!
//! The backend answers a successful refresh in one of two ways:
//! 1. A token pair in the body (raw, or inside a `{"data": ...}` envelope)
//! 2. No tokens at all: the session cookies were renewed via `Set-Cookie`

use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Token pair as returned by the refresh endpoint.
///
/// Field names follow the backend (camelCase); snake_case is accepted too.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(rename = "accessToken", alias = "access_token")]
    pub access_token: String,
    #[serde(rename = "refreshToken", alias = "refresh_token", default)]
    pub refresh_token: Option<String>,
}

/// Outcome of a successful refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshGrant {
    /// New tokens to persist and attach as bearer credentials.
    Tokens {
        access: Secret<String>,
        refresh: Option<Secret<String>>,
    },
    /// The server renewed its session cookies; nothing to attach.
    CookieRenewed,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

/// POST the refresh endpoint and interpret the answer.
///
/// In cookie mode `refresh` is None and the body is an empty object; the
/// `sh_rt` cookie in the shared jar carries the refresh credential.
pub async fn refresh_session(
    client: &reqwest::Client,
    url: &str,
    refresh: Option<&Secret<String>>,
    timeout: Duration,
) -> Result<RefreshGrant> {
    let request = client.post(url).timeout(timeout);
    let request = match refresh {
        Some(token) => request.json(&RefreshRequest {
            refresh_token: token.expose(),
        }),
        None => request.json(&serde_json::json!({})),
    };

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Http(format!("refresh request failed: {e}"))
        }
    })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading refresh response: {e}")))?;

    if !status.is_success() {
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(Error::RefreshRejected(format!("{status}: {body}")));
        }
        return Err(Error::RefreshFailed(format!(
            "refresh endpoint returned {status}: {body}"
        )));
    }

    parse_grant(&body)
}

/// Interpret a 2xx refresh body.
fn parse_grant(body: &str) -> Result<RefreshGrant> {
    if body.trim().is_empty() {
        debug!("refresh returned empty body, assuming cookie renewal");
        return Ok(RefreshGrant::CookieRenewed);
    }

    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| Error::RefreshFailed(format!("invalid refresh response: {e}")))?;

    // Business error smuggled in a 200
    if let Some(code) = value.get("error").filter(|e| !e.is_null()) {
        let message = value
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("refresh failed");
        return Err(Error::RefreshRejected(format!("{code}: {message}")));
    }

    let payload = match value.get("data") {
        Some(data) => data.clone(),
        None => value,
    };

    match serde_json::from_value::<TokenResponse>(payload) {
        Ok(tokens) => Ok(RefreshGrant::Tokens {
            access: Secret::new(tokens.access_token),
            refresh: tokens.refresh_token.map(Secret::new),
        }),
        Err(_) => {
            debug!("refresh response carried no tokens, assuming cookie renewal");
            Ok(RefreshGrant::CookieRenewed)
        }
    }
}
