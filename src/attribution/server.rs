use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::get,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, RunDb};
use super::pipeline::PipelineDefinition;
use super::providers::Providers;
use super::runner::{ExecutionPolicy, RunOrchestrator};
use super::store::RunStore;
use super::ws;
use crate::config::Config;

/// Configuration for the attribution API server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// SQLite file for durable runs; `None` keeps runs in memory only.
    pub db_path: Option<PathBuf>,
    pub cors_origins: Vec<String>,
    pub policy: ExecutionPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ServerConfig {
    fn from(config: &Config) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: Some(config.server.db_path.clone()),
            cors_origins: config.server.cors_origins.clone(),
            policy: ExecutionPolicy::from(&config.pipeline),
        }
    }
}

/// CORS allow-list for browser clients. Origins that are not valid header
/// values are dropped with a warning.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

/// Build the full application router with the API and the event socket.
pub fn build_router(state: SharedState, cors_origins: &[String]) -> Router {
    api::api_router()
        .route("/ws", get(ws::ws_handler))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

async fn open_store(db_path: Option<&PathBuf>) -> Result<RunStore> {
    let Some(path) = db_path else {
        return Ok(RunStore::in_memory());
    };
    let db = RunDb::new(path)
        .with_context(|| format!("Failed to open run database {}", path.display()))?;
    RunStore::open(DbHandle::new(db))
        .await
        .context("Failed to load runs from database")
}

pub async fn start_server(config: ServerConfig) -> Result<()> {
    let store = open_store(config.db_path.as_ref()).await?;
    let orchestrator = RunOrchestrator::new(
        store,
        PipelineDefinition::attribution(),
        Providers::offline(),
        config.policy,
    );

    let resumed = orchestrator.resume_interrupted().await;
    if !resumed.is_empty() {
        tracing::info!(count = resumed.len(), "Resumed interrupted runs");
    }

    let state = Arc::new(AppState::new(orchestrator.clone()));
    let app = build_router(state, &config.cors_origins);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, durable = config.db_path.is_some(), "EventSense API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    orchestrator.shutdown().await;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C; shutting down");
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let orchestrator = RunOrchestrator::new(
            RunStore::in_memory(),
            PipelineDefinition::attribution(),
            Providers::offline(),
            ExecutionPolicy::default(),
        );
        let state = Arc::new(AppState::new(orchestrator));
        build_router(state, &ServerConfig::default().cors_origins)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_allows_configured_origin() {
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/api/attribution/run")
            .header(header::ORIGIN, "http://localhost:3000")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "http://localhost:3000"
        );
    }

    #[tokio::test]
    async fn test_cors_rejects_unknown_origin() {
        let req = Request::builder()
            .uri("/healthz")
            .header(header::ORIGIN, "http://evil.example")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert!(resp.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }

    #[tokio::test]
    async fn test_ws_route_requires_upgrade() {
        let req = Request::builder()
            .uri("/ws?run_id=run_aaaaaaaaaaaa")
            .body(Body::empty())
            .unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_open_store_creates_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");
        let store = open_store(Some(&path)).await.unwrap();
        assert!(store.is_durable());
        assert!(path.exists());
        assert!(!open_store(None).await.unwrap().is_durable());
    }

    #[test]
    fn test_server_config_from_config() {
        let mut config = Config::default();
        config.server.port = 9100;
        config.pipeline.max_transient_retries = 1;
        let server = ServerConfig::from(&config);
        assert_eq!(server.port, 9100);
        assert_eq!(server.host, "127.0.0.1");
        assert_eq!(server.db_path, Some(PathBuf::from(".eventsense/runs.db")));
        assert_eq!(server.policy.max_transient_retries, 1);
        assert_eq!(server.cors_origins.len(), 2);
    }
}
