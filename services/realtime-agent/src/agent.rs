//! Wiring between the API client and the realtime connection
//!
//! The client and the connection manager refer to each other: the WebSocket
//! CONNECT frame carries the client's current bearer token, and a failed
//! refresh in the client must close the realtime connection. The second
//! edge goes through a `Notify` so neither side owns the other.
//!
//! The broker cannot refresh tokens, so the session is checked through the
//! pipeline first: at start-up, and before any CONNECT whose token is about
//! to expire. A 401 on that check runs the normal refresh; a failed refresh
//! fires the expiry handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pipeline::{ApiClient, ApiError};
use realtime::{
    ConnectionManager, Connector, HeaderFuture, HeaderSource, Message, ReconnectPolicy,
    UserNotifications, WebSocketConnector,
};
use serde_json::Value;
use session::{CredentialMode, FileSessionStore};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;

/// Tokens closer than this to `exp` are checked before they reach the broker.
const EXPIRY_WARNING: Duration = Duration::from_secs(60);

pub struct Agent {
    pub client: ApiClient,
    pub manager: ConnectionManager,
    notifications: Option<UserNotifications>,
    session_expired: Arc<AtomicBool>,
    expiry_task: JoinHandle<()>,
    session_check_path: String,
    pub started_at: Instant,
}

impl Agent {
    /// Load the session file and build the client and the connection
    /// manager. Nothing is connected yet.
    pub async fn build(config: &Config) -> Result<Self> {
        let store = FileSessionStore::load(config.agent.credentials_path.clone())
            .await
            .with_context(|| {
                format!(
                    "failed to load session from {}",
                    config.agent.credentials_path.display()
                )
            })?;

        let expired = Arc::new(Notify::new());
        let client = ApiClient::builder(config.pipeline_config())
            .session_store(Arc::new(store))
            .on_session_expired(Arc::new(expiry_notifier(expired.clone())))
            .build()
            .context("failed to build API client")?;

        let connector = WebSocketConnector::new(&config.realtime.url, config.handshake_timeout())
            .context("invalid realtime url")?
            .with_headers(bearer_headers(
                client.clone(),
                config.agent.session_check_path.clone(),
            ));

        Ok(Self::assemble(
            client,
            Arc::new(connector),
            config.reconnect_policy(),
            config.agent.user_id.as_deref(),
            &config.agent.session_check_path,
            expired,
        ))
    }

    fn assemble(
        client: ApiClient,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        user_id: Option<&str>,
        session_check_path: &str,
        expired: Arc<Notify>,
    ) -> Self {
        let manager = ConnectionManager::new(connector, policy);
        let session_expired = Arc::new(AtomicBool::new(false));
        let expiry_task = tokio::spawn(close_on_expiry(
            expired,
            manager.clone(),
            session_expired.clone(),
        ));
        let notifications =
            user_id.map(|id| UserNotifications::attach(&manager, id, on_notification));

        Self {
            client,
            manager,
            notifications,
            session_expired,
            expiry_task,
            session_check_path: session_check_path.to_string(),
            started_at: Instant::now(),
        }
    }

    /// Check the stored session through the pipeline, then open the realtime
    /// connection. A rejected session leaves the connection closed.
    pub async fn start(&self) {
        let credential = self.client.credential().await;
        match credential.mode {
            CredentialMode::Bearer if credential.expires_within(EXPIRY_WARNING) => {
                info!("stored access token expired or about to, checking session");
            }
            CredentialMode::Bearer => info!("using stored bearer session"),
            CredentialMode::Cookie => info!("no stored tokens, using cookie session"),
        }

        match self.client.get::<Value>(&self.session_check_path).await {
            Ok(_) => info!(path = %self.session_check_path, "session valid"),
            Err(e) if e.status == Some(401) => {
                warn!(error = %e, "session rejected, realtime connection stays closed");
                return;
            }
            Err(e) => warn!(error = %e, "session check failed, connecting anyway"),
        }
        self.manager.connect();
    }

    pub fn notifications_active(&self) -> bool {
        self.notifications
            .as_ref()
            .is_some_and(UserNotifications::is_active)
    }

    pub fn session_expired(&self) -> bool {
        self.session_expired.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.expiry_task.abort();
        self.manager.disconnect();
    }
}

/// Session-expiry handler that wakes the realtime side.
fn expiry_notifier(expired: Arc<Notify>) -> impl Fn(&ApiError) + Send + Sync + 'static {
    move |error: &ApiError| {
        warn!(path = ?error.path, "session expired, closing realtime connection");
        expired.notify_one();
    }
}

async fn close_on_expiry(expired: Arc<Notify>, manager: ConnectionManager, flag: Arc<AtomicBool>) {
    loop {
        expired.notified().await;
        flag.store(true, Ordering::Relaxed);
        crate::metrics::record_session_expired();
        manager.disconnect();
    }
}

/// CONNECT headers built from the client's credentials at each attempt.
///
/// A token inside the expiry window is first sent through `check_path` so
/// the pipeline can refresh it.
pub fn bearer_headers(client: ApiClient, check_path: String) -> HeaderSource {
    Arc::new(move || -> HeaderFuture {
        let client = client.clone();
        let check_path = check_path.clone();
        Box::pin(async move {
            if client.credential().await.expires_within(EXPIRY_WARNING) {
                if let Err(e) = client.get::<Value>(&check_path).await {
                    warn!(error = %e, "session check before CONNECT failed");
                }
            }
            client
                .credential()
                .await
                .authorization()
                .map(|value| vec![("Authorization".to_string(), value)])
                .unwrap_or_default()
        })
    })
}

fn on_notification(message: &Message) {
    let kind = message.body["type"].as_str().unwrap_or("unknown");
    info!(kind, topic = %message.topic, "notification received");
    crate::metrics::record_notification(kind);
}
