/// HTTP Server Module
///
/// Provides the health probe used by container deployments and a small
/// statistics endpoint for the knowledge base.

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::Utc;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::rag::RagSystem;

#[derive(Clone)]
pub struct AppState {
    pub rag_system: Arc<RagSystem>,
}

/// Create and configure the HTTP server router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats_endpoint))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "cosmetics_assistant_bot",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

/// Knowledge base statistics endpoint
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let documents = state.rag_system.count_documents().await.map_err(|e| {
        log::error!("Failed to count documents: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(serde_json::json!({
        "documents": documents,
        "timestamp": Utc::now().to_rfc3339()
    })))
}

/// Start the HTTP server
pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .context("Failed to bind HTTP server")?;

    log::info!("HTTP server listening on port {}", port);

    axum::serve(listener, app)
        .await
        .context("HTTP server error")?;

    Ok(())
}
