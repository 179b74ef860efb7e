//! The parent-availability poll loop

use super::files::add_strategy_hosts;
use super::{
    parse_host_status, parse_parent_config, read_host_status, read_strategies, ControlPort,
    CtlForm, ParentStatus, ReasonCode,
};
use crate::fsutil::TrackedFile;
use crate::models::CrStates;
use crate::ops::OpsClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::seq::IteratorRandom;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const PARENTS_FILE: &str = "parent.config";
const STRATEGIES_FILE: &str = "strategies.yaml";

/// Settings for the parent supervisor.
#[derive(Debug, Clone)]
pub struct ParentHealthConfig {
    pub trafficserver_config_dir: PathBuf,
    pub trafficserver_bin_dir: PathBuf,
    pub cdn: String,
    pub hostname: String,
    pub poll_interval: Duration,
    pub reason_code: ReasonCode,
    pub unavailable_poll_threshold: u32,
    pub markup_poll_threshold: u32,
    pub enable_active_markdowns: bool,
    pub poll_state_log: Option<PathBuf>,
    pub to_login_dispersion_factor: u64,
    pub monitor_timeout: Duration,
}

/// Where the supervisor gets refreshed configuration from. `reload` returns
/// `None` when nothing changed; `force` is set after a SIGHUP.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn reload(&self, force: bool) -> Result<Option<ParentHealthConfig>>;
}

/// A source that never changes; useful for tests and fixed deployments.
pub struct StaticConfigSource;

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn reload(&self, _force: bool) -> Result<Option<ParentHealthConfig>> {
        Ok(None)
    }
}

/// Minimal client for a monitor's publish API. Only the `caches` map is
/// consumed, which keeps it compatible across monitor versions.
pub struct MonitorClient {
    http: reqwest::Client,
}

impl MonitorClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building monitor client")?;
        Ok(Self { http })
    }

    pub async fn cr_states(&self, host: &str) -> Result<CrStates> {
        let url = format!("http://{host}/publish/CrStates");
        let resp = self.http.get(&url).send().await.with_context(|| format!("GET {url}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("GET {url}: status {}", resp.status());
        }
        resp.json().await.with_context(|| format!("decoding CrStates from {url}"))
    }
}

/// Listens for SIGHUP and raises the reload flag the supervisor consumes on
/// its next tick.
pub fn spawn_sighup_listener(flag: Arc<AtomicBool>) -> Result<()> {
    let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("installing SIGHUP handler")?;
    tokio::spawn(async move {
        while hup.recv().await.is_some() {
            info!("SIGHUP received, scheduling config reload");
            flag.store(true, Ordering::SeqCst);
        }
    });
    Ok(())
}

/// Owns the parents table and drives the mark-up/mark-down decisions.
pub struct ParentSupervisor {
    cfg: ParentHealthConfig,
    ops: OpsClient,
    ctl: Arc<dyn ControlPort>,
    source: Arc<dyn ConfigSource>,
    monitor_client: MonitorClient,
    ctl_form: CtlForm,
    parents: HashMap<String, ParentStatus>,
    parent_config: TrackedFile,
    strategies: TrackedFile,
    /// monitor host -> usable, as last reported by Ops
    monitors: HashMap<String, bool>,
    dispersion_remaining: Duration,
    reload_flag: Arc<AtomicBool>,
}

impl ParentSupervisor {
    /// Load the parents table from `parent.config`, `strategies.yaml`, and
    /// the host-status subsystem. Fails when the cache's config files are
    /// unreadable, which usually means trafficserver is not installed.
    pub async fn new(
        cfg: ParentHealthConfig,
        ops: OpsClient,
        ctl: Arc<dyn ControlPort>,
        source: Arc<dyn ConfigSource>,
    ) -> Result<Self> {
        let parent_config = TrackedFile::new(cfg.trafficserver_config_dir.join(PARENTS_FILE))
            .context("reading parent.config")?;
        let strategies = TrackedFile::new(cfg.trafficserver_config_dir.join(STRATEGIES_FILE))
            .context("reading strategies.yaml")?;
        let monitor_client = MonitorClient::new(cfg.monitor_timeout)?;

        let mut parents = HashMap::new();
        let content = std::fs::read_to_string(&parent_config.path)?;
        parse_parent_config(&content, &mut parents);
        let strat = read_strategies(&strategies.path, &cfg.trafficserver_config_dir)?;
        add_strategy_hosts(&strat, &mut parents);

        let (output, ctl_form) = read_host_status(ctl.as_ref(), CtlForm::V10)
            .await
            .context("reading trafficserver host status")?;
        parse_host_status(&output, &mut parents, cfg.reason_code);

        info!(parents = parents.len(), "startup loaded parent records");

        let dispersion =
            login_dispersion(&cfg.hostname, cfg.to_login_dispersion_factor, cfg.poll_interval);
        info!(dispersion_secs = dispersion.as_secs(), "Ops login dispersion");

        Ok(Self {
            cfg,
            ops,
            ctl,
            source,
            monitor_client,
            ctl_form,
            parents,
            parent_config,
            strategies,
            monitors: HashMap::new(),
            dispersion_remaining: dispersion,
            reload_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag raised by the SIGHUP listener.
    pub fn reload_flag(&self) -> Arc<AtomicBool> {
        self.reload_flag.clone()
    }

    pub fn parents(&self) -> &HashMap<String, ParentStatus> {
        &self.parents
    }

    /// Seed the usable-monitor table; normally filled from Ops.
    pub fn set_monitors(&mut self, monitors: HashMap<String, bool>) {
        self.monitors = monitors;
    }

    /// Runs for the process lifetime.
    pub async fn run(mut self) {
        info!("polling started");
        loop {
            self.poll_once().await;
            tokio::time::sleep(self.cfg.poll_interval).await;
        }
    }

    /// One full poll cycle. Any single failing step is logged and skipped;
    /// state is only mutated on success.
    pub async fn poll_once(&mut self) {
        let interval = self.cfg.poll_interval;

        let forced = self.reload_flag.swap(false, Ordering::SeqCst);
        match self.source.reload(forced).await {
            Ok(Some(new_cfg)) => {
                info!("configuration has been successfully updated");
                self.cfg = new_cfg;
                // a reload may follow an ATS upgrade, so re-detect the CLI form
                self.ctl_form = CtlForm::V10;
                self.refresh_monitors().await;
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "reading changed config, keeping the old config"),
        }

        if let Err(e) = self.update_parent_info().await {
            error!(error = %e, "could not load new ATS parent info");
        } else {
            debug!(parents = self.parents.len(), "updated parent info");
        }

        match self.fetch_cr_states().await {
            Ok(states) => {
                self.apply_monitor_opinion(states).await;
            }
            Err(e) => {
                error!(error = %e, "monitor polling failed");
                self.refresh_monitors().await;
                self.maybe_write_poll_state();
                return;
            }
        }

        if self.dispersion_remaining.is_zero() {
            self.dispersion_remaining = login_dispersion(
                &self.cfg.hostname,
                self.cfg.to_login_dispersion_factor,
                interval,
            );
            self.refresh_monitors().await;
        } else {
            self.dispersion_remaining = self.dispersion_remaining.saturating_sub(interval);
        }

        self.maybe_write_poll_state();
    }

    /// Re-read `parent.config` / `strategies.yaml` when their mtime
    /// advanced, then refresh the table from host status.
    async fn update_parent_info(&mut self) -> Result<()> {
        if self.parent_config.changed().context("checking parent.config")? {
            let content = std::fs::read_to_string(&self.parent_config.path)
                .context("reading parent.config")?;
            parse_parent_config(&content, &mut self.parents);
            self.parent_config.mark_read()?;
            info!(parents = self.parents.len(), "updated parents from new parent.config");
        }

        if self.strategies.changed().context("checking strategies.yaml")? {
            let strat = read_strategies(&self.strategies.path, &self.cfg.trafficserver_config_dir)
                .context("updating strategies.yaml")?;
            add_strategy_hosts(&strat, &mut self.parents);
            self.strategies.mark_read()?;
            info!(parents = self.parents.len(), "updated parents from new strategies.yaml");
        }

        let (output, form) = read_host_status(self.ctl.as_ref(), self.ctl_form)
            .await
            .context("trafficserver may not be running")?;
        self.ctl_form = form;
        parse_host_status(&output, &mut self.parents, self.cfg.reason_code);
        Ok(())
    }

    /// Pick one usable monitor uniformly at random and fetch its CrStates.
    async fn fetch_cr_states(&self) -> Result<CrStates> {
        let monitor = self
            .monitors
            .iter()
            .filter(|(_, usable)| **usable)
            .map(|(host, _)| host.clone())
            .choose(&mut rand::thread_rng())
            .context("there are no available monitors")?;
        debug!(monitor = %monitor, "polling");
        self.monitor_client.cr_states(&monitor).await
    }

    /// Apply one monitor opinion set to the parents table.
    pub async fn apply_monitor_opinion(&mut self, states: CrStates) {
        let now = chrono::Utc::now().timestamp();
        let reason = self.cfg.reason_code;

        for (host, state) in states.caches {
            let Some(parent) = self.parents.get_mut(&host) else { continue };
            parent.last_tm_poll = now;
            let tm_available = state.is_available;
            let locally_available = parent.available(reason);

            if locally_available != tm_available {
                if !self.cfg.enable_active_markdowns && !tm_available {
                    info!(
                        host = %host,
                        "monitor reports the host should be marked DOWN, but mark downs are disabled by configuration"
                    );
                } else if let Err(e) = self.mark_parent(&host, &state.status, tm_available).await {
                    error!(error = %e, host = %host, "marking parent");
                }
            }

            if let Some(parent) = self.parents.get_mut(&host) {
                if parent.available(reason) && tm_available && parent.unavailable_poll_count > 0 {
                    debug!(
                        host = %host,
                        count = parent.unavailable_poll_count,
                        "resetting the unavailable poll count"
                    );
                    parent.unavailable_poll_count = 0;
                }
            }
        }
    }

    /// Hysteresis: a parent is only marked after the monitor has held its
    /// opinion for the configured number of consecutive polls.
    async fn mark_parent(&mut self, host: &str, cache_status: &str, available: bool) -> Result<()> {
        let reason = self.cfg.reason_code;
        let Some(parent) = self.parents.get(host) else { return Ok(()) };
        let fqdn = parent.fqdn.clone();
        let mut unavailable_count = parent.unavailable_poll_count;
        let mut mark_up_count = parent.mark_up_poll_count;
        let host_available;

        if !available {
            unavailable_count += 1;
            if unavailable_count < self.cfg.unavailable_poll_threshold {
                info!(
                    host = %host,
                    count = unavailable_count,
                    "monitor indicates the host is unavailable but the unavailable-poll threshold has not been reached"
                );
                host_available = true;
            } else {
                self.ctl.mark_host(&fqdn, false, reason).await?;
                host_available = false;
                unavailable_count = 0;
                mark_up_count = 0;
                info!(host = %host, cache_status, "marked parent DOWN");
            }
        } else {
            mark_up_count += 1;
            if mark_up_count < self.cfg.markup_poll_threshold {
                info!(
                    host = %host,
                    count = mark_up_count,
                    "monitor indicates the host is available but the mark-up-poll threshold has not been reached"
                );
                host_available = false;
            } else {
                self.ctl.mark_host(&fqdn, true, reason).await?;
                host_available = true;
                unavailable_count = 0;
                mark_up_count = 0;
                info!(host = %host, cache_status, "marked parent UP");
            }
        }

        if let Some(parent) = self.parents.get_mut(host) {
            match reason {
                ReasonCode::Active => parent.active_reason = host_available,
                ReasonCode::Local => parent.local_reason = host_available,
                // the manual bit is only ever changed by the CLI itself and
                // read back from host status
                ReasonCode::Manual => {}
            }
            parent.unavailable_poll_count = unavailable_count;
            parent.mark_up_poll_count = mark_up_count;
            debug!(host = %host, status = ?parent, "updated parent status");
        }
        Ok(())
    }

    pub async fn refresh_monitors(&mut self) {
        match self.ops.monitors(&self.cfg.cdn).await {
            Ok(list) => {
                self.monitors = list
                    .into_iter()
                    .map(|m| {
                        let usable = m.usable();
                        (m.fqdn, usable)
                    })
                    .collect();
                info!(monitors = self.monitors.len(), "updated monitor statuses from Ops");
            }
            Err(e) => {
                error!(error = %e, "could not update the list of monitors, keeping the old list");
            }
        }
    }

    fn maybe_write_poll_state(&self) {
        let Some(path) = &self.cfg.poll_state_log else { return };
        let state = serde_json::json!({
            "parents": self.parents,
            "monitors": self.monitors,
        });
        match serde_json::to_vec_pretty(&state) {
            Ok(data) => {
                if let Err(e) = std::fs::write(path, data) {
                    error!(error = %e, path = %path.display(), "could not write the poll state log");
                }
            }
            Err(e) => error!(error = %e, "marshalling poll state"),
        }
    }
}

/// Deterministic per-host dispersion so a fleet reboot does not stampede
/// Ops with monitor-list refreshes.
pub fn login_dispersion(hostname: &str, factor: u64, interval: Duration) -> Duration {
    if factor == 0 {
        return interval;
    }
    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    let slot = hasher.finish() % factor;
    interval * (factor + slot) as u32
}
