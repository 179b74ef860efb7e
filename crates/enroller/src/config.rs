//! Enroller configuration

use agent_lib::OpsConfig;
use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollerConfig {
    /// Base directory of the per-type drop directories; empty disables the
    /// watcher
    #[serde(default)]
    pub watch_dir: String,

    /// Ingest/health API port; 0 disables the HTTP server
    #[serde(default)]
    pub http_port: u16,

    /// Marker file created once the front-ends accept work
    #[serde(default = "default_started_file")]
    pub started_file: PathBuf,

    #[serde(default)]
    pub ops_url: String,

    #[serde(default)]
    pub ops_user: String,

    #[serde(default)]
    pub ops_password: String,
}

fn default_started_file() -> PathBuf {
    PathBuf::from("enroller-started")
}

impl EnrollerConfig {
    pub fn load(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("ENROLLER").try_parsing(true))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn ops_config(&self) -> OpsConfig {
        OpsConfig {
            url: self.ops_url.clone(),
            user: self.ops_user.clone(),
            password: self.ops_password.clone(),
            api_version: "4.0".to_string(),
            timeout_secs: 60,
            initial_backoff_secs: 1,
            max_backoff_secs: 300,
        }
    }
}
