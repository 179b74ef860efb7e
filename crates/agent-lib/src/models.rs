//! Shared wire and data models for the control loop

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-cache availability as published by a monitor at `/publish/CrStates`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrStates {
    pub caches: HashMap<String, CacheState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheState {
    #[serde(rename = "isAvailable")]
    pub is_available: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

impl CrStates {
    pub fn set(&mut self, cache: impl Into<String>, available: bool, status: impl Into<String>) {
        self.caches.insert(
            cache.into(),
            CacheState { is_available: available, status: status.into() },
        );
    }
}

/// The node's pending-work record as held by Ops.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerUpdateStatus {
    #[serde(rename = "host_name")]
    pub host_name: String,
    #[serde(rename = "upd_pending")]
    pub update_pending: bool,
    #[serde(rename = "reval_pending")]
    pub reval_pending: bool,
    #[serde(rename = "use_reval_pending", default)]
    pub use_reval_pending: bool,
    #[serde(rename = "parent_pending", default)]
    pub parent_pending: bool,
    #[serde(rename = "parent_reval_pending", default)]
    pub parent_reval_pending: bool,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "config_update_time", default)]
    pub config_update_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "revalidate_update_time", default)]
    pub revalidate_update_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// A package the node is expected to have installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
}

impl Package {
    /// `name-version`, the form the package database reports.
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// One alert from the Ops response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub text: String,
    pub level: String,
}

impl Alert {
    pub fn is_error(&self) -> bool {
        self.level == "error"
    }
}

/// Whether a set of alerts signals an idempotent create collision.
pub fn is_already_exists(alerts: &[Alert]) -> bool {
    alerts
        .iter()
        .any(|a| a.is_error() && a.text.contains("already exists"))
}

/// A config file as produced by the generator, before audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    pub text: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// The monitoring document for one CDN: which caches and peer monitors to
/// probe, how often, and in what format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    #[serde(rename = "trafficServers", default)]
    pub traffic_servers: Vec<MonitoredCache>,
    #[serde(rename = "trafficMonitors", default)]
    pub traffic_monitors: Vec<MonitoredPeer>,
    #[serde(default)]
    pub config: MonitoringParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredCache {
    #[serde(rename = "hostName")]
    pub host_name: String,
    pub fqdn: String,
    #[serde(default)]
    pub status: String,
    /// Health poll URL; `${hostname}` is substituted with the v4 or v6
    /// service address by the probe-set derivation.
    #[serde(rename = "pollURL", default)]
    pub poll_url: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ip6: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredPeer {
    #[serde(rename = "hostName")]
    pub host_name: String,
    pub fqdn: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringParameters {
    #[serde(rename = "health.polling.interval", default = "default_poll_ms")]
    pub health_polling_interval_ms: u64,
    #[serde(rename = "peers.polling.interval", default = "default_poll_ms")]
    pub peer_polling_interval_ms: u64,
    #[serde(rename = "health.polling.format", default = "default_poll_format")]
    pub health_polling_format: String,
    #[serde(rename = "health.connection.timeout", default = "default_poll_timeout_ms")]
    pub health_connection_timeout_ms: u64,
}

impl Default for MonitoringParameters {
    fn default() -> Self {
        Self {
            health_polling_interval_ms: default_poll_ms(),
            peer_polling_interval_ms: default_poll_ms(),
            health_polling_format: default_poll_format(),
            health_connection_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

fn default_poll_ms() -> u64 {
    6000
}

fn default_poll_format() -> String {
    "application/json".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    2000
}

/// A monitor known to Ops, with its reported usability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorRef {
    #[serde(rename = "hostName")]
    pub host_name: String,
    pub fqdn: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: String,
}

impl MonitorRef {
    /// Monitors in ONLINE state are usable for CrStates queries.
    pub fn usable(&self) -> bool {
        self.status == "ONLINE"
    }
}
