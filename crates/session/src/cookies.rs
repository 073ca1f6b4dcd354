//! Cookie inspection for the API origin
//!
//! The pipeline and the refresh client share one `reqwest` cookie jar, so
//! server-set cookies ride along on every call. This module only answers
//! questions about that jar: is there a CSRF token to echo back, and is the
//! server tracking a session for us.

use std::sync::Arc;

use reqwest::Url;
use reqwest::cookie::{CookieStore, Jar};

use crate::constants::{ACCESS_COOKIE, CSRF_COOKIE, REFRESH_COOKIE};

/// Read-only view of the cookies the jar would send to the API origin.
#[derive(Clone)]
pub struct SessionCookies {
    jar: Arc<Jar>,
    origin: Url,
}

impl SessionCookies {
    pub fn new(jar: Arc<Jar>, origin: Url) -> Self {
        Self { jar, origin }
    }

    pub fn jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    /// Value of a named cookie, if the jar holds one for the origin.
    pub fn get(&self, name: &str) -> Option<String> {
        let header = self.jar.cookies(&self.origin)?;
        let header = header.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }

    /// CSRF token to echo in `X-XSRF-TOKEN`.
    pub fn csrf_token(&self) -> Option<String> {
        self.get(CSRF_COOKIE).filter(|v| !v.is_empty())
    }

    /// Whether the server has set a session cookie for this client.
    pub fn has_session(&self) -> bool {
        self.get(ACCESS_COOKIE).is_some() || self.get(REFRESH_COOKIE).is_some()
    }
}
