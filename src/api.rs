//! Health and readiness endpoints.

use crate::config::ApiConfig;
use crate::index_store::IndexStore;
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<IndexStore>,
    pub service_name: String,
    pub version: &'static str,
    pub instance_id: Uuid,
}

/// Liveness/readiness response body
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    version: &'static str,
    instance_id: Uuid,
}

/// Serve the API until cancelled.
pub async fn serve(state: AppState, config: &ApiConfig, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind API listener on {}:{}", config.host, config.port))?;

    info!(host = %config.host, port = config.port, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.service_name.clone(),
        version: state.version,
        instance_id: state.instance_id,
    })
}

async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(state.store.pool()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ready",
                service: state.service_name.clone(),
                version: state.version,
                instance_id: state.instance_id,
            }),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                    service: state.service_name.clone(),
                    version: state.version,
                    instance_id: state.instance_id,
                }),
            )
        }
    }
}
