//! Realtime Agent
//!
//! Headless process that keeps a marketplace session alive:
//! 1. Loads the stored session and builds the authenticated API client
//! 2. Opens the realtime broker connection with the current bearer token
//! 3. Keeps the user's notification queue subscribed across reconnects
//! 4. Serves `/health` and `/metrics` until SIGINT/SIGTERM

mod agent;
mod config;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::agent::Agent;
use crate::config::Config;

/// Time allowed for in-flight HTTP requests after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    agent: Arc<Agent>,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting realtime-agent");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.agent.listen_addr,
        api = %config.api.base_url,
        realtime = %config.realtime.url,
        max_attempts = config.realtime.max_attempts,
        notifications = config.agent.user_id.is_some(),
        "configuration loaded"
    );

    let agent = Arc::new(Agent::build(&config).await?);
    agent.start().await;

    let app = build_router(
        AppState {
            agent: agent.clone(),
            prometheus: prometheus_handle,
        },
        config.agent.max_connections,
    );

    let listener = TcpListener::bind(config.agent.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.agent.listen_addr))?;
    info!(addr = %config.agent.listen_addr, "accepting requests");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Unsubscribe and close the broker session before draining HTTP
    agent.shutdown();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("http server stopped"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: 200 while the realtime connection is up, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let agent = &state.agent;
    let connection = agent.manager.state();
    let credential = agent.client.credential().await;

    let status_code = if connection.status == realtime::ConnectionStatus::Connected {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    let status = if agent.session_expired() {
        "session_expired"
    } else if status_code.is_success() {
        "healthy"
    } else {
        "degraded"
    };

    let body = serde_json::json!({
        "status": status,
        "credential_mode": credential.mode.label(),
        "connection": connection.status.label(),
        "attempt": connection.attempt,
        "retry_pending": connection.retry_pending,
        "subscriptions": agent.manager.subscription_count(),
        "notifications": agent.notifications_active(),
        "uptime_seconds": agent.started_at.elapsed().as_secs(),
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tests::{test_agent, wait_for};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use realtime::ConnectionStatus;
    use tower::ServiceExt;

    /// PrometheusHandle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_connected_agent() {
        let (agent, _) = test_agent(true, Some("42")).await;
        let agent = Arc::new(agent);
        agent.start().await;
        wait_for(&agent.manager, ConnectionStatus::Connected).await;

        let app = build_router(
            AppState {
                agent: agent.clone(),
                prometheus: test_prometheus_handle(),
            },
            16,
        );
        let (status, json) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["connection"], "connected");
        assert_eq!(json["credential_mode"], "cookie");
        assert_eq!(json["attempt"], 0);
        assert_eq!(json["subscriptions"], 1);
        assert_eq!(json["notifications"], true);
    }

    #[tokio::test]
    async fn health_is_degraded_before_connect() {
        let (agent, _) = test_agent(false, None).await;
        let app = build_router(
            AppState {
                agent: Arc::new(agent),
                prometheus: test_prometheus_handle(),
            },
            16,
        );
        let (status, json) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["connection"], "disconnected");
        assert_eq!(json["notifications"], false);
    }

    #[tokio::test]
    async fn health_reports_session_expiry() {
        let (agent, expired) = test_agent(true, None).await;
        let agent = Arc::new(agent);
        agent.start().await;
        wait_for(&agent.manager, ConnectionStatus::Connected).await;

        expired.notify_one();
        wait_for(&agent.manager, ConnectionStatus::Disconnected).await;

        let app = build_router(
            AppState {
                agent,
                prometheus: test_prometheus_handle(),
            },
            16,
        );
        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "session_expired");
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text() {
        let (agent, _) = test_agent(false, None).await;
        let app = build_router(
            AppState {
                agent: Arc::new(agent),
                prometheus: test_prometheus_handle(),
            },
            16,
        );
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[axum::http::header::CONTENT_TYPE],
            "text/plain; version=0.0.4; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (agent, _) = test_agent(false, None).await;
        let app = build_router(
            AppState {
                agent: Arc::new(agent),
                prometheus: test_prometheus_handle(),
            },
            16,
        );
        let response = app
            .oneshot(Request::builder().uri("/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
