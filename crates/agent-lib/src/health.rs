//! Component health tracking for the daemons
//!
//! Backs the liveness and readiness endpoints of the monitor and the
//! enroller: each long-running task reports its own state, and the
//! aggregate decides the HTTP status.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational but impaired, e.g. Ops unreachable on the last poll.
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_change_timestamp: i64,
}

impl ComponentHealth {
    fn now(status: ComponentStatus, message: Option<String>) -> Self {
        Self { status, message, last_change_timestamp: chrono::Utc::now().timestamp() }
    }
}

/// Component names used by the daemons.
pub mod components {
    pub const CONFIG_POLLER: &str = "config_poller";
    pub const CACHE_POLLER: &str = "cache_poller";
    pub const PEER_POLLER: &str = "peer_poller";
    pub const COMBINER: &str = "combiner";
    pub const OPS_SESSION: &str = "ops_session";
    pub const WATCHER: &str = "watcher";
    pub const INGEST: &str = "ingest";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub ready: bool,
    pub components: HashMap<String, ComponentHealth>,
}

/// Shared registry; clones refer to the same state.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    components: HashMap<String, ComponentHealth>,
    ready: bool,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy.
    pub async fn register(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentStatus::Healthy, None).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Degraded, Some(message.into())).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentStatus::Unhealthy, Some(message.into())).await;
    }

    async fn set(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let mut inner = self.inner.write().await;
        inner
            .components
            .insert(name.to_string(), ComponentHealth::now(status, message));
    }

    /// Flip once startup is complete.
    pub async fn set_ready(&self, ready: bool) {
        self.inner.write().await.ready = ready;
    }

    pub async fn report(&self) -> HealthReport {
        let inner = self.inner.read().await;
        let mut status = ComponentStatus::Healthy;
        for health in inner.components.values() {
            match health.status {
                ComponentStatus::Unhealthy => {
                    status = ComponentStatus::Unhealthy;
                    break;
                }
                ComponentStatus::Degraded => status = ComponentStatus::Degraded,
                ComponentStatus::Healthy => {}
            }
        }
        HealthReport {
            status,
            ready: inner.ready && status != ComponentStatus::Unhealthy,
            components: inner.components.clone(),
        }
    }
}
