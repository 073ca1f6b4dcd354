//! Session credentials for the marketplace API client
//!
//! Owns everything the client knows about "who is logged in":
//! stored bearer tokens, the server-set session cookies, token expiry, and
//! the refresh-endpoint call. The request pipeline reads credentials through
//! the `SessionStore` trait and is the only writer during a refresh.
//!
//! Credential flow:
//! 1. Login stores a token pair via `SessionStore::store_tokens()` (bearer mode),
//!    or the server sets `sh_at`/`sh_rt` cookies (cookie mode)
//! 2. `Credential::resolve()` derives the mode for each outgoing request
//! 3. On 401 the pipeline calls `token::refresh_session()` exactly once
//! 4. New tokens are persisted, or the cookie renewal is accepted as-is
//! 5. On refresh failure or logout the store is cleared

pub mod constants;
pub mod cookies;
pub mod credentials;
pub mod error;
pub mod expiry;
pub mod token;

pub use constants::*;
pub use cookies::SessionCookies;
pub use credentials::{
    Credential, CredentialMode, FileSessionStore, MemorySessionStore, SessionStore, StoreFuture,
    TokenPair,
};
pub use error::{Error, Result};
pub use expiry::{expires_within, token_expiry};
pub use token::{RefreshGrant, TokenResponse, refresh_session};
