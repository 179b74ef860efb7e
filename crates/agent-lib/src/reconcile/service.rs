//! Service control seam

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcStatus {
    Running,
    NotRunning,
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn status(&self, svc: &str) -> Result<SvcStatus>;
    async fn start(&self, svc: &str) -> Result<()>;
    async fn restart(&self, svc: &str) -> Result<()>;
    /// `traffic_ctl config reload`
    async fn reload_config(&self) -> Result<()>;
    /// `sysctl -p`
    async fn run_sysctl(&self) -> Result<()>;
    /// Enable the service at boot.
    async fn enable(&self, svc: &str) -> Result<()>;
}

/// Real implementation over `service`, `systemctl`, `traffic_ctl`, and
/// `sysctl`.
pub struct SystemService {
    ts_bin_dir: PathBuf,
}

impl SystemService {
    pub fn new(ts_bin_dir: impl Into<PathBuf>) -> Self {
        Self { ts_bin_dir: ts_bin_dir.into() }
    }

    async fn run(bin: &str, args: &[&str]) -> Result<(String, i32)> {
        debug!(bin, ?args, "exec");
        let output = tokio::process::Command::new(bin)
            .args(args)
            .output()
            .await
            .with_context(|| format!("running {bin}"))?;
        Ok((
            format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            ),
            output.status.code().unwrap_or(-1),
        ))
    }
}

#[async_trait]
impl ServiceManager for SystemService {
    async fn status(&self, svc: &str) -> Result<SvcStatus> {
        let (out, _) = Self::run("/usr/sbin/service", &[svc, "status"]).await?;
        if out.contains("Active: active") || out.contains("is running") {
            Ok(SvcStatus::Running)
        } else {
            Ok(SvcStatus::NotRunning)
        }
    }

    async fn start(&self, svc: &str) -> Result<()> {
        let (out, rc) = Self::run("/usr/sbin/service", &[svc, "start"]).await?;
        if rc != 0 {
            bail!("starting {svc}: {out}");
        }
        Ok(())
    }

    async fn restart(&self, svc: &str) -> Result<()> {
        let (out, rc) = Self::run("/usr/sbin/service", &[svc, "restart"]).await?;
        if rc != 0 {
            bail!("restarting {svc}: {out}");
        }
        Ok(())
    }

    async fn reload_config(&self) -> Result<()> {
        let ctl = self.ts_bin_dir.join("traffic_ctl");
        let ctl = ctl.to_string_lossy();
        let (out, rc) = Self::run(&ctl, &["config", "reload"]).await?;
        if rc != 0 {
            bail!("traffic_ctl config reload failed: {out}");
        }
        Ok(())
    }

    async fn run_sysctl(&self) -> Result<()> {
        let (out, rc) = Self::run("/usr/sbin/sysctl", &["-p"]).await?;
        if rc != 0 {
            bail!("sysctl -p failed: {out}");
        }
        Ok(())
    }

    async fn enable(&self, svc: &str) -> Result<()> {
        let (out, rc) = Self::run("/bin/systemctl", &["enable", svc]).await?;
        if rc != 0 {
            bail!("enabling {svc}: {out}");
        }
        Ok(())
    }
}
