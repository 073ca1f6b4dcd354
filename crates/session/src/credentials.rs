//! Credential storage for session tokens
//!
//! A `SessionStore` holds at most one token pair: the access token the client
//! attaches as `Authorization: Bearer` and the refresh token it trades for a new
//! one. Two implementations exist: `MemorySessionStore` for short-lived clients
//! and tests, and `FileSessionStore`, which persists the pair as JSON by
//! staging a sibling file and renaming it over the old one.
//!
//! The store is process-wide mutable state. The refresh coordinator is its only
//! writer while a refresh is in flight; everything else reads it, except an
//! explicit logout which clears it.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::expiry;

/// Boxed future returned by `SessionStore` methods (keeps the trait dyn-compatible).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An access/refresh token pair as held by a store.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access: Secret<String>,
    pub refresh: Option<Secret<String>>,
}

/// How the backend authenticates this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialMode {
    /// Server-set cookies authenticate every call; no Authorization header.
    Cookie,
    /// The client attaches `Authorization: Bearer <access token>`.
    Bearer,
}

impl CredentialMode {
    /// Derive the mode from what the client can observe.
    ///
    /// A visible session cookie always wins: the server is tracking the session
    /// itself. Without one, stored tokens mean bearer mode. With neither there is
    /// nothing to attach, so the client falls back to cookie mode and lets the
    /// server decide.
    pub fn resolve(has_tokens: bool, session_cookie_present: bool) -> Self {
        if session_cookie_present || !has_tokens {
            CredentialMode::Cookie
        } else {
            CredentialMode::Bearer
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CredentialMode::Cookie => "cookie",
            CredentialMode::Bearer => "bearer",
        }
    }
}

/// Snapshot of the credentials used for one outgoing request.
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: Option<Secret<String>>,
    pub refresh_token: Option<Secret<String>>,
    pub mode: CredentialMode,
}

impl Credential {
    pub fn resolve(tokens: Option<TokenPair>, session_cookie_present: bool) -> Self {
        let mode = CredentialMode::resolve(tokens.is_some(), session_cookie_present);
        match tokens {
            Some(pair) => Self {
                access_token: Some(pair.access),
                refresh_token: pair.refresh,
                mode,
            },
            None => Self {
                access_token: None,
                refresh_token: None,
                mode,
            },
        }
    }

    /// `Authorization` header value, or None in cookie mode.
    pub fn authorization(&self) -> Option<String> {
        match (self.mode, &self.access_token) {
            (CredentialMode::Bearer, Some(token)) => Some(token.bearer()),
            _ => None,
        }
    }

    /// Whether the access token expires within `window`.
    ///
    /// Opaque (non-JWT) tokens and cookie-mode sessions report false: the client
    /// cannot see their expiry and relies on the 401 path instead.
    pub fn expires_within(&self, window: Duration) -> bool {
        self.access_token
            .as_ref()
            .is_some_and(|t| expiry::expires_within(t.expose(), window))
    }
}

/// Storage backend for the session token pair.
///
/// Uses boxed futures so implementations can be shared as `Arc<dyn SessionStore>`.
pub trait SessionStore: Send + Sync {
    /// Current token pair, if one is stored.
    fn tokens(&self) -> StoreFuture<'_, Option<TokenPair>>;

    /// Replace the access token. A `None` refresh token keeps the stored one.
    fn store_tokens(
        &self,
        access: Secret<String>,
        refresh: Option<Secret<String>>,
    ) -> StoreFuture<'_, Result<()>>;

    /// Forget all stored tokens.
    fn clear(&self) -> StoreFuture<'_, Result<()>>;
}

/// In-memory store. Tokens are lost when the process exits.
#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<Option<TokenPair>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tokens(access: impl Into<Secret<String>>, refresh: Option<&str>) -> Self {
        Self {
            state: Mutex::new(Some(TokenPair {
                access: access.into(),
                refresh: refresh.map(Secret::from),
            })),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn tokens(&self) -> StoreFuture<'_, Option<TokenPair>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn store_tokens(
        &self,
        access: Secret<String>,
        refresh: Option<Secret<String>>,
    ) -> StoreFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let refresh = refresh.or_else(|| state.as_ref().and_then(|p| p.refresh.clone()));
            *state = Some(TokenPair { access, refresh });
            debug!("stored session tokens in memory");
            Ok(())
        })
    }

    fn clear(&self) -> StoreFuture<'_, Result<()>> {
        Box::pin(async move {
            *self.state.lock().await = None;
            debug!("cleared in-memory session tokens");
            Ok(())
        })
    }
}

/// On-disk form of the token pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTokens {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken", default)]
    refresh_token: Option<String>,
}

impl From<&StoredTokens> for TokenPair {
    fn from(stored: &StoredTokens) -> Self {
        TokenPair {
            access: Secret::from(stored.access_token.as_str()),
            refresh: stored.refresh_token.as_deref().map(Secret::from),
        }
    }
}

/// JSON-file store.
///
/// The Mutex serializes writes from refresh and logout; reads clone the
/// in-memory copy so they never touch the disk.
pub struct FileSessionStore {
    path: PathBuf,
    state: Mutex<Option<StoredTokens>>,
}

impl FileSessionStore {
    /// Load the session file, creating it empty (`null`) on cold start.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading session file: {e}")))?;
            let stored: Option<StoredTokens> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing session file: {e}")))?;
            info!(path = %path.display(), logged_in = stored.is_some(), "loaded session file");
            stored
        } else {
            info!(path = %path.display(), "session file not found, starting logged out");
            persist(&path, &None).await?;
            None
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }
}

impl SessionStore for FileSessionStore {
    fn tokens(&self) -> StoreFuture<'_, Option<TokenPair>> {
        Box::pin(async move { self.state.lock().await.as_ref().map(TokenPair::from) })
    }

    fn store_tokens(
        &self,
        access: Secret<String>,
        refresh: Option<Secret<String>>,
    ) -> StoreFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let refresh_token = match refresh {
                Some(r) => Some(r.expose().clone()),
                None => state.as_ref().and_then(|s| s.refresh_token.clone()),
            };
            *state = Some(StoredTokens {
                access_token: access.expose().clone(),
                refresh_token,
            });
            persist(&self.path, &state).await
        })
    }

    fn clear(&self) -> StoreFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            *state = None;
            persist(&self.path, &state).await
        })
    }
}

/// Replace the session file with `data`.
///
/// The JSON is staged in a sibling file created owner-only (0600 on unix),
/// flushed, then renamed over `path`. Readers see either the old pair or
/// the new one.
async fn persist(path: &Path, data: &Option<StoredTokens>) -> Result<()> {
    let json = serde_json::to_vec_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("encoding session: {e}")))?;
    let staged = staged_path(path)?;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(&staged)
        .await
        .map_err(|e| Error::Io(format!("creating {}: {e}", staged.display())))?;
    file.write_all(&json)
        .await
        .map_err(|e| Error::Io(format!("writing {}: {e}", staged.display())))?;
    file.sync_all()
        .await
        .map_err(|e| Error::Io(format!("flushing {}: {e}", staged.display())))?;
    drop(file);

    tokio::fs::rename(&staged, path)
        .await
        .map_err(|e| Error::Io(format!("replacing {}: {e}", path.display())))?;

    debug!(path = %path.display(), logged_in = data.is_some(), "session file replaced");
    Ok(())
}

/// `<dir>/<name>.<pid>.staged` next to the session file, so the rename
/// never crosses filesystems.
fn staged_path(path: &Path) -> Result<PathBuf> {
    let mut name = path
        .file_name()
        .ok_or_else(|| Error::Io(format!("session path {} names no file", path.display())))?
        .to_os_string();
    name.push(format!(".{}.staged", std::process::id()));
    Ok(path.with_file_name(name))
}
