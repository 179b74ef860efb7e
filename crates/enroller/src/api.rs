//! HTTP ingest front-end
//!
//! `POST /api/<ver>/<type>` hands the request body to the same dispatcher
//! the directory watcher uses.

use agent_lib::enroll::{Dispatcher, Outcome};
use agent_lib::health::{ComponentStatus, HealthRegistry};
use agent_lib::observability::Metrics;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub health: HealthRegistry,
    pub metrics: Metrics,
}

async fn ingest(
    State(state): State<AppState>,
    Path((_version, ty)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if !state.dispatcher.supported(&ty) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("no handler for creating {ty}")})),
        );
    }
    match state.dispatcher.dispatch(&ty, &body).await {
        Ok(outcome) => {
            let label = match outcome {
                Outcome::Created => "created",
                Outcome::Skipped => "skipped",
                Outcome::Empty => "empty",
            };
            state.metrics.inc_enroll_document(&ty, label);
            info!(r#type = %ty, outcome = label, "ingested document");
            (StatusCode::OK, Json(serde_json::json!({"outcome": label})))
        }
        Err(e) => {
            state.metrics.inc_enroll_document(&ty, "error");
            warn!(r#type = %ty, error = %e, "ingest failed");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.report().await;
    let code = match report.status {
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(report))
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.report().await;
    let code = if report.ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(report))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response();
    }
    ([(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")], buffer).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/:version/:type", post(ingest))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "http ingest started");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}
