//! HTTP surface: the analyze endpoints, the run registry API and health.

pub mod api;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::VeloConfig;
use crate::orchestrator::Healer;

pub use api::{AppState, SharedState};

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    pub keepalive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            dev_mode: false,
            keepalive: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    /// From the `[server]` section; CLI flags override afterwards.
    pub fn from_config(config: &VeloConfig) -> Self {
        let server = &config.toml.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            dev_mode: false,
            keepalive: Duration::from_secs(server.keepalive_secs.max(1)),
        }
    }
}

pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Serve until Ctrl-C, then cancel live runs and drain connections.
pub async fn start_server(config: ServerConfig, healer: Arc<Healer>) -> Result<()> {
    let state = Arc::new(AppState {
        healer: Arc::clone(&healer),
        keepalive: config.keepalive,
    });
    let app = build_router(state, config.dev_mode);

    let host = if config.dev_mode { "0.0.0.0" } else { config.host.as_str() };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, dev = config.dev_mode, "velo server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(healer))
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal(healer: Arc<Healer>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutting down, cancelling live runs");
    // Open event streams end once their runs settle.
    healer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::passing_healer;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode, header};
    use tower::ServiceExt;

    fn state() -> SharedState {
        Arc::new(AppState {
            healer: Arc::new(passing_healer()),
            keepalive: Duration::from_secs(15),
        })
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = build_router(state(), false);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_dev_mode_allows_cors() {
        let app = build_router(state(), true);
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/analyze")
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = build_router(state(), false);
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_server_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = VeloConfig::new(dir.path().to_path_buf()).unwrap();
        config.toml.server.port = 8080;
        config.toml.server.keepalive_secs = 0;
        let server = ServerConfig::from_config(&config);
        assert_eq!(server.port, 8080);
        assert_eq!(server.keepalive, Duration::from_secs(1));
    }
}
