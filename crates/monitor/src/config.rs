//! Monitor daemon configuration

use agent_lib::OpsConfig;
use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// This monitor's host name, used to exclude itself from peer polling
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// CDN whose monitoring config drives the probe sets
    #[serde(default)]
    pub cdn: String,

    /// Port for the publish/health/metrics API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Ops base URL
    #[serde(default)]
    pub ops_url: String,

    #[serde(default)]
    pub ops_user: String,

    #[serde(default)]
    pub ops_password: String,

    /// Monitoring config poll interval in seconds
    #[serde(default = "default_config_poll_interval")]
    pub config_poll_interval_secs: u64,

    /// Peers that must agree before an unavailable local view is overruled
    #[serde(default)]
    pub peer_optimistic_quorum_min: usize,

    /// ipv4only, ipv6only, or both
    #[serde(default = "default_polling_family")]
    pub polling_family: String,

    /// Retained availability events
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_config_poll_interval() -> u64 {
    5
}

fn default_polling_family() -> String {
    "ipv4only".to_string()
}

fn default_max_events() -> usize {
    200
}

impl MonitorConfig {
    /// Load from the environment, with an optional JSON file underneath.
    pub fn load(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("MONITOR").try_parsing(true))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn ops_config(&self) -> OpsConfig {
        OpsConfig {
            url: self.ops_url.clone(),
            user: self.ops_user.clone(),
            password: self.ops_password.clone(),
            api_version: "4.0".to_string(),
            timeout_secs: 30,
            initial_backoff_secs: 1,
            max_backoff_secs: 300,
        }
    }
}
