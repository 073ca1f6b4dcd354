//! Authenticated request pipeline
//!
//! Every call goes through `ApiClient::request`:
//! 1. Resolve credentials: bearer token from the store, or cookie mode
//! 2. Attach `Authorization` (bearer mode) and `X-XSRF-TOKEN` (if a CSRF cookie
//!    exists and the caller did not set one); cookies ride along from the jar
//! 3. Send with a bounded timeout
//! 4. Failure: classify into `ApiError`. A first 401 on a refreshable endpoint
//!    goes through the single-flight refresh and is replayed once
//! 5. Success: decode the envelope into an `ApiResponse`
//!
//! The refresh call uses a second `reqwest::Client` that shares the cookie jar
//! but bypasses this pipeline entirely.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use reqwest::Method;
use reqwest::cookie::Jar;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use session::constants::{CSRF_HEADER, LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH};
use session::{
    Credential, CredentialMode, MemorySessionStore, RefreshGrant, SessionCookies, SessionStore,
};
use tracing::{debug, info, instrument, warn};

use crate::envelope::{ApiResponse, Envelope};
use crate::error::{ApiError, BuildError};
use crate::policy::EndpointPolicy;
use crate::refresh::{RefreshCoordinator, RefreshFailed, RefreshOutcome, Settled};

/// Default timeout for API calls, including the refresh call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Notified once when a refresh fails and the local session is cleared.
pub trait SessionExpiredHandler: Send + Sync {
    fn session_expired(&self, error: &ApiError);
}

impl<F> SessionExpiredHandler for F
where
    F: Fn(&ApiError) + Send + Sync,
{
    fn session_expired(&self, error: &ApiError) {
        self(error)
    }
}

/// Static pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub refresh_timeout: Duration,
    pub refresh_path: String,
    pub public_paths: Vec<String>,
}

impl PipelineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
            refresh_timeout: DEFAULT_TIMEOUT,
            refresh_path: REFRESH_PATH.to_string(),
            public_paths: Vec::new(),
        }
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HeaderMap,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// What to do with the Authorization header on one attempt.
enum AuthHeader {
    Attach(String),
    Strip,
    Leave,
}

pub struct ApiClientBuilder {
    config: PipelineConfig,
    store: Option<Arc<dyn SessionStore>>,
    on_expired: Option<Arc<dyn SessionExpiredHandler>>,
    jar: Option<Arc<Jar>>,
}

impl ApiClientBuilder {
    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn on_session_expired(mut self, handler: Arc<dyn SessionExpiredHandler>) -> Self {
        self.on_expired = Some(handler);
        self
    }

    /// Share an existing cookie jar (e.g. with a realtime handshake).
    pub fn cookie_jar(mut self, jar: Arc<Jar>) -> Self {
        self.jar = Some(jar);
        self
    }

    pub fn build(self) -> Result<ApiClient, BuildError> {
        let origin: reqwest::Url = self
            .config
            .base_url
            .parse()
            .map_err(|e| BuildError::InvalidBaseUrl(format!("{}: {e}", self.config.base_url)))?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(BuildError::InvalidBaseUrl(format!(
                "{}: scheme must be http or https",
                self.config.base_url
            )));
        }

        let jar = self.jar.unwrap_or_default();
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .build()
            .map_err(|e| BuildError::Client(e.to_string()))?;
        let refresh_http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .build()
            .map_err(|e| BuildError::Client(e.to_string()))?;

        let policy = EndpointPolicy::new(&self.config.refresh_path, &self.config.public_paths);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        Ok(ApiClient {
            inner: Arc::new(Inner {
                http,
                refresh_http,
                cookies: SessionCookies::new(jar, origin),
                config: self.config,
                policy,
                store,
                coordinator: RefreshCoordinator::new(),
                on_expired: self.on_expired,
            }),
        })
    }
}

struct Inner {
    http: reqwest::Client,
    refresh_http: reqwest::Client,
    cookies: SessionCookies,
    config: PipelineConfig,
    policy: EndpointPolicy,
    store: Arc<dyn SessionStore>,
    coordinator: RefreshCoordinator,
    on_expired: Option<Arc<dyn SessionExpiredHandler>>,
}

/// Cheap to clone; clones share the store, the jar and the refresh coordinator.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

impl ApiClient {
    pub fn builder(config: PipelineConfig) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            store: None,
            on_expired: None,
            jar: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn cookies(&self) -> &SessionCookies {
        &self.inner.cookies
    }

    pub fn session_store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    /// Credentials as the next request would use them.
    pub async fn credential(&self) -> Credential {
        let tokens = self.inner.store.tokens().await;
        Credential::resolve(tokens, self.inner.cookies.has_session())
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.coordinator.is_refreshing()
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>, ApiError> {
        self.request(Method::GET, path, None, RequestOptions::default())
            .await?
            .deserialize()
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<ApiResponse<T>, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = to_body(body, path)?;
        self.request(Method::POST, path, Some(&body), RequestOptions::default())
            .await?
            .deserialize()
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<ApiResponse<T>, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = to_body(body, path)?;
        self.request(Method::PUT, path, Some(&body), RequestOptions::default())
            .await?
            .deserialize()
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<ApiResponse<T>, ApiError> {
        self.request(Method::DELETE, path, None, RequestOptions::default())
            .await?
            .deserialize()
    }

    /// Log in with the given credentials body and keep any returned tokens.
    ///
    /// Backends running cookie sessions answer without tokens; the jar then
    /// holds the session and nothing is stored.
    pub async fn login<B: Serialize + ?Sized>(&self, body: &B) -> Result<ApiResponse<Value>, ApiError> {
        let body = to_body(body, LOGIN_PATH)?;
        let response = self
            .request(Method::POST, LOGIN_PATH, Some(&body), RequestOptions::default())
            .await?;

        let access = response.get("accessToken").or_else(|| response.get("access_token"));
        if let Some(access) = access.and_then(Value::as_str) {
            let refresh = response
                .get("refreshToken")
                .or_else(|| response.get("refresh_token"))
                .and_then(Value::as_str)
                .map(Secret::from);
            if let Err(e) = self.inner.store.store_tokens(Secret::from(access), refresh).await {
                warn!(error = %e, "failed to persist login tokens");
            }
            info!("logged in with bearer tokens");
        } else {
            info!("logged in with cookie session");
        }
        Ok(response)
    }

    /// Tell the backend to end the session, then forget local credentials
    /// whatever it answered.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self
            .request(
                Method::POST,
                LOGOUT_PATH,
                Some(&serde_json::json!({})),
                RequestOptions::default(),
            )
            .await;
        if let Err(e) = self.inner.store.clear().await {
            warn!(error = %e, "failed to clear session store on logout");
        }
        info!("logged out");
        result.map(|_| ())
    }

    /// Issue a call through the full pipeline.
    #[instrument(skip_all, fields(method = %method, path = %path))]
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse<Value>, ApiError> {
        let url = format!("{}{}", self.inner.config.base_url.trim_end_matches('/'), path);
        let mut retried = false;
        let mut replay_with: Option<RefreshOutcome> = None;

        loop {
            let credential = self.credential().await;
            let auth = match &replay_with {
                Some(RefreshOutcome::Bearer(token)) => AuthHeader::Attach(token.bearer()),
                Some(RefreshOutcome::Cookie) => AuthHeader::Strip,
                None => match credential.authorization() {
                    Some(value) => AuthHeader::Attach(value),
                    None => AuthHeader::Leave,
                },
            };

            let result = self.send(&method, &url, path, body, &options, auth).await;
            record_outcome(&method, &result);

            match result {
                Err(err)
                    if err.status == Some(401) && !retried && self.inner.policy.may_refresh(path) =>
                {
                    retried = true;
                    if let Some(current) = self.rotated_since(&credential).await {
                        debug!("token replaced while request was in flight, replaying");
                        replay_with = Some(RefreshOutcome::Bearer(current));
                        continue;
                    }
                    let settled = self
                        .inner
                        .coordinator
                        .run(|| self.refresh_session(&err))
                        .await;
                    match settled {
                        Ok(outcome) => {
                            debug!("replaying request after refresh");
                            replay_with = Some(outcome);
                        }
                        Err(_) => return Err(err),
                    }
                }
                other => return other,
            }
        }
    }

    /// One HTTP exchange: headers, send, classify, decode.
    async fn send(
        &self,
        method: &Method,
        url: &str,
        path: &str,
        body: Option<&Value>,
        options: &RequestOptions,
        auth: AuthHeader,
    ) -> Result<ApiResponse<Value>, ApiError> {
        let mut headers = options.headers.clone();
        match auth {
            AuthHeader::Attach(value) => {
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| ApiError::decode(format!("invalid token value: {e}"), Some(path)))?;
                headers.insert(AUTHORIZATION, value);
            }
            AuthHeader::Strip => {
                headers.remove(AUTHORIZATION);
            }
            AuthHeader::Leave => {}
        }

        if !headers.contains_key(CSRF_HEADER) {
            if let Some(token) = self.inner.cookies.csrf_token() {
                match HeaderValue::from_str(&token) {
                    Ok(v) => {
                        headers.insert(HeaderName::from_static(CSRF_HEADER), v);
                    }
                    Err(e) => warn!(error = %e, "skipping unusable CSRF cookie value"),
                }
            }
        }

        let mut request = self
            .inner
            .http
            .request(method.clone(), url)
            .headers(headers)
            .timeout(options.timeout.unwrap_or(self.inner.config.timeout));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            warn!(error = %e, timeout = e.is_timeout(), "request failed without a response");
            ApiError::network(&e, path)
        })?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| ApiError::network(&e, path))?;

        if !(200..300).contains(&status) {
            let err = ApiError::from_response(status, &text, path);
            debug!(status, kind = err.kind.label(), code = ?err.code, "request rejected");
            return Err(err);
        }

        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Envelope::decode(value).into_response(status, path)
    }

    /// Stored access token, when it is no longer the one `sent` carried.
    ///
    /// A 401 for a token that another call already refreshed must replay with
    /// the stored token instead of refreshing again.
    async fn rotated_since(&self, sent: &Credential) -> Option<Secret<String>> {
        if sent.mode != CredentialMode::Bearer {
            return None;
        }
        let current = self.inner.store.tokens().await?.access;
        (sent.access_token.as_ref() != Some(&current)).then_some(current)
    }

    /// The leader's half of a refresh: call the endpoint, persist or clear.
    ///
    /// The refresh token is read from the store here, not from the request's
    /// snapshot, so a token rotated by an earlier refresh is never replayed.
    async fn refresh_session(&self, trigger: &ApiError) -> Settled {
        info!("access rejected, refreshing session");
        let refresh_token = self.inner.store.tokens().await.and_then(|t| t.refresh);
        let url = format!(
            "{}{}",
            self.inner.config.base_url.trim_end_matches('/'),
            self.inner.config.refresh_path
        );

        let grant = session::refresh_session(
            &self.inner.refresh_http,
            &url,
            refresh_token.as_ref(),
            self.inner.config.refresh_timeout,
        )
        .await;

        match grant {
            Ok(RefreshGrant::Tokens { access, refresh }) => {
                if let Err(e) = self.inner.store.store_tokens(access.clone(), refresh).await {
                    warn!(error = %e, "failed to persist refreshed tokens");
                }
                metrics::counter!("pipeline_refresh_total", "outcome" => "tokens").increment(1);
                info!("session refreshed with new tokens");
                Ok(RefreshOutcome::Bearer(access))
            }
            Ok(RefreshGrant::CookieRenewed) => {
                metrics::counter!("pipeline_refresh_total", "outcome" => "cookie").increment(1);
                info!("session cookies renewed");
                Ok(RefreshOutcome::Cookie)
            }
            Err(e) => {
                metrics::counter!("pipeline_refresh_total", "outcome" => "failed").increment(1);
                warn!(error = %e, "session refresh failed, clearing credentials");
                if let Err(e) = self.inner.store.clear().await {
                    warn!(error = %e, "failed to clear session store");
                }
                self.notify_expired(trigger);
                Err(RefreshFailed(e.to_string()))
            }
        }
    }

    fn notify_expired(&self, trigger: &ApiError) {
        match &self.inner.on_expired {
            Some(handler) => handler.session_expired(trigger),
            None => warn!("session expired, please log in again"),
        }
    }
}

fn to_body<B: Serialize + ?Sized>(body: &B, path: &str) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|e| ApiError::decode(e, Some(path)))
}

fn record_outcome(method: &Method, result: &Result<ApiResponse<Value>, ApiError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.kind.label(),
    };
    metrics::counter!(
        "pipeline_requests_total",
        "method" => method.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
