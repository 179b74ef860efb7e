//! Publish and health API

use agent_lib::health::{ComponentStatus, HealthRegistry};
use agent_lib::models::CrStates;
use agent_lib::monitor::EventLog;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus::{Encoder, TextEncoder};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub health: HealthRegistry,
    pub combined_rx: watch::Receiver<CrStates>,
    pub events: Arc<Mutex<EventLog>>,
}

/// The authoritative per-cache availability view.
async fn cr_states(State(state): State<AppState>) -> impl IntoResponse {
    let states = state.combined_rx.borrow().clone();
    Json(states)
}

/// Recent availability transitions, newest first.
async fn event_log(State(state): State<AppState>) -> impl IntoResponse {
    let events = match state.events.lock() {
        Ok(log) => log.snapshot(),
        Err(_) => Vec::new(),
    };
    Json(serde_json::json!({ "events": events }))
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
        .route("/publish/CrStates", get(cr_states))
        .route("/publish/EventLog", get(event_log))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    info!(addr = %addr, "starting publish API");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_lib::monitor::Event;

    fn test_state() -> (AppState, watch::Sender<CrStates>) {
        let (tx, rx) = watch::channel(CrStates::default());
        let state = AppState {
            health: HealthRegistry::new(),
            combined_rx: rx,
            events: Arc::new(Mutex::new(EventLog::new(10))),
        };
        (state, tx)
    }

    #[tokio::test]
    async fn test_cr_states_endpoint_serves_latest_view() {
        let (state, tx) = test_state();
        let mut states = CrStates::default();
        states.set("edge-01", true, "REPORTED");
        tx.send_replace(states);

        let app = router(state);
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(server, app).await.unwrap() });

        let body: serde_json::Value =
            reqwest::get(format!("http://{addr}/publish/CrStates")).await.unwrap().json().await.unwrap();
        assert_eq!(body["caches"]["edge-01"]["isAvailable"], true);
    }

    #[tokio::test]
    async fn test_readyz_tracks_registry() {
        let (state, _tx) = test_state();
        state.health.set_ready(true).await;
        state.events.lock().unwrap().add(Event {
            time: chrono::Utc::now(),
            name: "edge-01".into(),
            hostname: "edge-01".into(),
            event_type: "CACHE".into(),
            available: true,
            description: String::new(),
        });

        let app = router(state);
        let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(server, app).await.unwrap() });

        let resp = reqwest::get(format!("http://{addr}/readyz")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let events: serde_json::Value =
            reqwest::get(format!("http://{addr}/publish/EventLog")).await.unwrap().json().await.unwrap();
        assert_eq!(events["events"][0]["name"], "edge-01");
    }
}
