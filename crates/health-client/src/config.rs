//! Health client configuration
//!
//! A JSON config file holds the static settings; a separate credentials
//! file holds the Ops login. Both are re-read by the poll loop when their
//! mtime advances or on SIGHUP.

use agent_lib::parent::{ConfigSource, ParentHealthConfig, ReasonCode};
use agent_lib::OpsConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct HealthClientFile {
    #[serde(default = "default_ts_config_dir")]
    pub trafficserver_config_dir: PathBuf,
    #[serde(default = "default_ts_bin_dir")]
    pub trafficserver_bin_dir: PathBuf,
    pub cdn: String,
    pub hostname: String,
    #[serde(default = "default_poll_interval_secs")]
    pub tm_polling_interval_secs: u64,
    #[serde(default = "default_reason_code")]
    pub reason_code: String,
    #[serde(default = "default_threshold")]
    pub unavailable_poll_threshold: u32,
    #[serde(default = "default_threshold")]
    pub markup_poll_threshold: u32,
    #[serde(default = "default_true")]
    pub enable_active_markdowns: bool,
    #[serde(default)]
    pub enable_poll_state_log: bool,
    #[serde(default = "default_poll_state_log")]
    pub poll_state_log: PathBuf,
    #[serde(default = "default_dispersion_factor")]
    pub to_login_dispersion_factor: u64,
    #[serde(default = "default_monitor_timeout_secs")]
    pub monitor_request_timeout_secs: u64,
    pub ops_url: String,
    /// Separate file holding `{"user": ..., "password": ...}`
    pub credentials_file: PathBuf,
}

fn default_ts_config_dir() -> PathBuf {
    PathBuf::from("/opt/trafficserver/etc/trafficserver")
}

fn default_ts_bin_dir() -> PathBuf {
    PathBuf::from("/opt/trafficserver/bin")
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_reason_code() -> String {
    "manual".to_string()
}

fn default_threshold() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_poll_state_log() -> PathBuf {
    PathBuf::from("/var/log/cache-health-client/poll-state.json")
}

fn default_dispersion_factor() -> u64 {
    90
}

fn default_monitor_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

pub fn load_file(path: &Path) -> Result<HealthClientFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_credentials(path: &Path) -> Result<Credentials> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading credentials file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

impl HealthClientFile {
    pub fn parent_config(&self) -> ParentHealthConfig {
        ParentHealthConfig {
            trafficserver_config_dir: self.trafficserver_config_dir.clone(),
            trafficserver_bin_dir: self.trafficserver_bin_dir.clone(),
            cdn: self.cdn.clone(),
            hostname: self.hostname.clone(),
            poll_interval: Duration::from_secs(self.tm_polling_interval_secs),
            reason_code: ReasonCode::parse(&self.reason_code),
            unavailable_poll_threshold: self.unavailable_poll_threshold,
            markup_poll_threshold: self.markup_poll_threshold,
            enable_active_markdowns: self.enable_active_markdowns,
            poll_state_log: self.enable_poll_state_log.then(|| self.poll_state_log.clone()),
            to_login_dispersion_factor: self.to_login_dispersion_factor,
            monitor_timeout: Duration::from_secs(self.monitor_request_timeout_secs),
        }
    }

    pub fn ops_config(&self, creds: &Credentials) -> OpsConfig {
        OpsConfig {
            url: self.ops_url.clone(),
            user: creds.user.clone(),
            password: creds.password.clone(),
            api_version: "4.0".to_string(),
            timeout_secs: 15,
            initial_backoff_secs: 1,
            max_backoff_secs: 300,
        }
    }
}

/// Mtime-tracked config source consumed by the supervisor each tick.
pub struct FileConfigSource {
    path: PathBuf,
    credentials_path: PathBuf,
    last_modify: Mutex<(i64, i64)>,
}

impl FileConfigSource {
    pub fn new(path: PathBuf, credentials_path: PathBuf) -> Result<Self> {
        let config_mtime = agent_lib::fsutil::file_mod_time(&path)?;
        let creds_mtime = agent_lib::fsutil::file_mod_time(&credentials_path)?;
        Ok(Self {
            path,
            credentials_path,
            last_modify: Mutex::new((config_mtime, creds_mtime)),
        })
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn reload(&self, force: bool) -> Result<Option<ParentHealthConfig>> {
        let config_mtime = agent_lib::fsutil::file_mod_time(&self.path)?;
        let creds_mtime = agent_lib::fsutil::file_mod_time(&self.credentials_path)?;

        let changed = {
            let mut last = self
                .last_modify
                .lock()
                .map_err(|_| anyhow::anyhow!("config mtime lock poisoned"))?;
            let changed = force || config_mtime > last.0 || creds_mtime > last.1;
            *last = (config_mtime, creds_mtime);
            changed
        };
        if !changed {
            return Ok(None);
        }

        info!(path = %self.path.display(), "config or credentials changed, reloading");
        let file = load_file(&self.path)?;
        // re-read credentials to keep the session viable after rotation
        let _ = load_credentials(&self.credentials_path)?;
        Ok(Some(file.parent_config()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path) -> (PathBuf, PathBuf) {
        let creds = dir.join("credentials.json");
        std::fs::write(&creds, r#"{"user": "watcher", "password": "pw"}"#).unwrap();
        let cfg = dir.join("config.json");
        std::fs::write(
            &cfg,
            format!(
                r#"{{
                    "cdn": "cdn-a",
                    "hostname": "edge-01",
                    "ops_url": "https://ops.example",
                    "credentials_file": "{}",
                    "reason_code": "active",
                    "unavailable_poll_threshold": 3
                }}"#,
                creds.display()
            ),
        )
        .unwrap();
        (cfg, creds)
    }

    #[test]
    fn test_load_and_convert() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg_path, creds_path) = write_config(dir.path());

        let file = load_file(&cfg_path).unwrap();
        let parent = file.parent_config();
        assert_eq!(parent.cdn, "cdn-a");
        assert_eq!(parent.reason_code, ReasonCode::Active);
        assert_eq!(parent.unavailable_poll_threshold, 3);
        assert_eq!(parent.markup_poll_threshold, 2);
        assert!(parent.poll_state_log.is_none());

        let creds = load_credentials(&creds_path).unwrap();
        assert_eq!(file.ops_config(&creds).user, "watcher");
    }

    #[tokio::test]
    async fn test_source_reports_changes_once() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg_path, creds_path) = write_config(dir.path());
        let source = FileConfigSource::new(cfg_path.clone(), creds_path).unwrap();

        assert!(source.reload(false).await.unwrap().is_none());

        std::thread::sleep(std::time::Duration::from_millis(20));
        let raw = std::fs::read_to_string(&cfg_path).unwrap();
        std::fs::write(&cfg_path, raw).unwrap();
        assert!(source.reload(false).await.unwrap().is_some());
        // consumed: no further change reported
        assert!(source.reload(false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_source_honors_force() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg_path, creds_path) = write_config(dir.path());
        let source = FileConfigSource::new(cfg_path, creds_path).unwrap();
        assert!(source.reload(true).await.unwrap().is_some());
    }
}
