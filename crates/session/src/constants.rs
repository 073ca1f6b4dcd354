//! Wire names shared with the backend
//!
//! Cookie and header names are fixed by the backend's session filter. Endpoint
//! paths are relative to the configured API origin.

/// Access-token cookie set by the backend (HttpOnly in browsers)
pub const ACCESS_COOKIE: &str = "sh_at";

/// Refresh-token cookie set by the backend (HttpOnly in browsers)
pub const REFRESH_COOKIE: &str = "sh_rt";

/// Readable cookie carrying the CSRF token
pub const CSRF_COOKIE: &str = "XSRF-TOKEN";

/// Header the backend expects the CSRF token in
pub const CSRF_HEADER: &str = "x-xsrf-token";

pub const LOGIN_PATH: &str = "/auth/login";
pub const REGISTER_PATH: &str = "/auth/register";
pub const FORGOT_PASSWORD_PATH: &str = "/auth/forgot-password";
pub const RESET_PASSWORD_PATH: &str = "/auth/reset-password";
pub const REFRESH_PATH: &str = "/auth/refresh";
pub const LOGOUT_PATH: &str = "/auth/logout";
pub const VALIDATE_PATH: &str = "/auth/validate";
pub const OAUTH_COMPLETE_PATH: &str = "/auth/oauth2/complete";
