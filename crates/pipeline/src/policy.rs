//! Which endpoints may enter the 401 refresh protocol
//!
//! Two lists, matched on whole path segments:
//! - auth endpoints (login, register, password reset, refresh) never refresh;
//!   their own failure message must reach the caller verbatim
//! - refresh-excluded endpoints (refresh, validate, logout, OAuth completion,
//!   configured public reads) never refresh, to avoid refresh loops

use session::constants::{
    FORGOT_PASSWORD_PATH, LOGIN_PATH, LOGOUT_PATH, OAUTH_COMPLETE_PATH, REGISTER_PATH,
    RESET_PASSWORD_PATH, VALIDATE_PATH,
};

#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    auth_paths: Vec<String>,
    excluded_paths: Vec<String>,
}

impl EndpointPolicy {
    /// `refresh_path` is the configured refresh endpoint; `public_paths` are
    /// extra read endpoints that answer 401 for anonymous users by design.
    pub fn new(refresh_path: &str, public_paths: &[String]) -> Self {
        let auth_paths = [
            LOGIN_PATH,
            REGISTER_PATH,
            FORGOT_PASSWORD_PATH,
            RESET_PASSWORD_PATH,
            refresh_path,
        ]
        .iter()
        .map(|p| p.to_string())
        .collect();

        let mut excluded_paths: Vec<String> = [refresh_path, VALIDATE_PATH, LOGOUT_PATH, OAUTH_COMPLETE_PATH]
            .iter()
            .map(|p| p.to_string())
            .collect();
        excluded_paths.extend(public_paths.iter().cloned());

        Self {
            auth_paths,
            excluded_paths,
        }
    }

    /// Credential-bearing auth call whose errors pass through untouched.
    pub fn is_auth_endpoint(&self, path: &str) -> bool {
        self.auth_paths.iter().any(|e| matches_endpoint(path, e))
    }

    /// Whether a 401 from `path` may trigger a session refresh.
    pub fn may_refresh(&self, path: &str) -> bool {
        !self.is_auth_endpoint(path) && !self.excluded_paths.iter().any(|e| matches_endpoint(path, e))
    }
}

/// True when `endpoint` occurs in `path` ending on a segment boundary.
fn matches_endpoint(path: &str, endpoint: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.is_empty() {
        return false;
    }
    path.match_indices(endpoint).any(|(idx, _)| {
        let rest = &path[idx + endpoint.len()..];
        rest.is_empty() || rest.starts_with('/')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> EndpointPolicy {
        EndpointPolicy::new("/auth/refresh", &["/listings/public".to_string()])
    }

    #[test]
    fn login_is_auth_endpoint() {
        let p = policy();
        assert!(p.is_auth_endpoint("/auth/login"));
        assert!(p.is_auth_endpoint("/api/auth/login?redirect=%2F"));
        assert!(!p.may_refresh("/auth/login"));
    }

    #[test]
    fn segment_boundary_is_respected() {
        let p = policy();
        assert!(!p.is_auth_endpoint("/auth/login-history"));
        assert!(p.may_refresh("/auth/login-history"));
    }

    #[test]
    fn refresh_and_validate_never_refresh() {
        let p = policy();
        assert!(!p.may_refresh("/auth/refresh"));
        assert!(!p.may_refresh("/auth/validate"));
        assert!(!p.may_refresh("/auth/logout"));
        assert!(!p.may_refresh("/auth/oauth2/complete"));
    }

    #[test]
    fn public_reads_are_excluded() {
        let p = policy();
        assert!(!p.may_refresh("/listings/public"));
        assert!(!p.may_refresh("/listings/public/42"));
        assert!(p.may_refresh("/listings/42"));
    }

    #[test]
    fn business_endpoints_may_refresh() {
        let p = policy();
        assert!(p.may_refresh("/cart"));
        assert!(p.may_refresh("/offers/9/accept"));
    }
}
