//! Access-token expiry inspection
//!
//! Access tokens issued by the backend are JWTs. The client never verifies
//! them; it only peeks at the `exp` claim to tell whether a token is about to
//! lapse. Anything that does not decode is treated as "expiry unknown".

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// `exp` claim of a JWT, as unix seconds. None for opaque or malformed tokens.
pub fn token_expiry(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_u64()
}

/// Whether `token` expires within `window` from now.
pub fn expires_within(token: &str, window: Duration) -> bool {
    let Some(exp) = token_expiry(token) else {
        return false;
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    exp <= now + window.as_secs()
}
