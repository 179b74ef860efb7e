//! The apply state machine
//!
//! Drives one reconciliation of the node: pending-flag gating, status
//! files, packages, config generation and audit, atomic writes, the
//! service transition, the maxmind refresh, and the report back to Ops.

use super::audit::{check_cert, ids_of_user, process_remap_overrides, process_udev_rules};
use super::check_reload::{classify, ServiceNeeds};
use super::diff::files_differ;
use super::git::{commit_all, ensure_repo, GitMode};
use super::lock::AppLock;
use super::maxmind::check_maxmind_update;
use super::packages::{execute_plan, plan_packages, PackageManager};
use super::refs::{RefsChecker, RefsConfig};
use super::service::{ServiceManager, SvcStatus};
use super::{exit_code, UpdateStatus};
use crate::fsutil::{atomic_write, mkdir_with_owner, touch, FileOwnership};
use crate::models::ServerUpdateStatus;
use crate::ops::OpsClient;
use anyhow::{bail, Context, Result};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const LOCK_RETRY_TIMEOUT: Duration = Duration::from_secs(60);

const REMAP_ADJACENT_PREFIXES: &[&str] =
    &["bg_fetch", "hdr_rw_", "regex_remap_", "set_dscp_", "url_sig_", "uri_signing"];

/// Which part of the config surface this invocation considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesMode {
    All,
    Reval,
}

impl FromStr for FilesMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(FilesMode::All),
            "reval" => Ok(FilesMode::Reval),
            other => bail!("invalid files mode '{other}', expected all or reval"),
        }
    }
}

/// What the invocation is allowed to do to the cache service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    None,
    Reload,
    Restart,
}

impl FromStr for ServiceAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ServiceAction::None),
            "reload" => Ok(ServiceAction::Reload),
            "restart" => Ok(ServiceAction::Restart),
            other => bail!("invalid service action '{other}', expected none, reload or restart"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyConfig {
    pub host: String,
    pub files: FilesMode,
    pub service_action: ServiceAction,
    pub report_only: bool,
    pub install_packages: bool,
    pub wait_for_parents: bool,
    pub ignore_update_flag: bool,
    pub no_unset_update_flag: bool,
    pub git: GitMode,
    pub maxmind_location: Option<String>,
    pub update_ip_allow: bool,
    pub skip_os_check: bool,
    pub ts_config_dir: PathBuf,
    pub ts_plugin_dir: PathBuf,
    pub ts_bin_dir: PathBuf,
    pub status_dir: PathBuf,
    pub lock_path: PathBuf,
    pub ats_user: String,
    pub dev_dir: PathBuf,
}

impl ApplyConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            files: FilesMode::All,
            service_action: ServiceAction::None,
            report_only: false,
            install_packages: false,
            wait_for_parents: false,
            ignore_update_flag: false,
            no_unset_update_flag: false,
            git: GitMode::No,
            maxmind_location: None,
            update_ip_allow: false,
            skip_os_check: false,
            ts_config_dir: PathBuf::from("/opt/trafficserver/etc/trafficserver"),
            ts_plugin_dir: PathBuf::from("/opt/trafficserver/libexec/trafficserver"),
            ts_bin_dir: PathBuf::from("/opt/trafficserver/bin"),
            status_dir: PathBuf::from("/var/lib/cache-agent/status"),
            lock_path: PathBuf::from("/var/run/cache-agent.lock"),
            ats_user: "ats".to_string(),
            dev_dir: PathBuf::from("/dev"),
        }
    }
}

/// One generated file moving through audit and apply.
#[derive(Debug, Clone)]
struct ConfigFileState {
    name: String,
    dir: PathBuf,
    path: PathBuf,
    body: Vec<u8>,
    uid: u32,
    gid: u32,
    mode: u32,
    service: String,
    audit_complete: bool,
    audit_failed: bool,
    prereq_failed: bool,
    change_needed: bool,
    change_applied: bool,
}

pub struct Reconciler {
    cfg: ApplyConfig,
    ops: OpsClient,
    packages: Arc<dyn PackageManager>,
    services: Arc<dyn ServiceManager>,
    http: reqwest::Client,
    config_files: HashMap<String, ConfigFileState>,
    warnings: BTreeMap<String, Vec<String>>,
    changed_files: Vec<String>,
    installed_pkgs: HashSet<String>,
    pkg_installed_cache: HashMap<String, bool>,
    remap_config_reload: bool,
    traffic_ctl_reload: bool,
    sysctl_reload: bool,
    observed_status: Option<ServerUpdateStatus>,
}

impl Reconciler {
    pub fn new(
        cfg: ApplyConfig,
        ops: OpsClient,
        packages: Arc<dyn PackageManager>,
        services: Arc<dyn ServiceManager>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            cfg,
            ops,
            packages,
            services,
            http,
            config_files: HashMap::new(),
            warnings: BTreeMap::new(),
            changed_files: Vec::new(),
            installed_pkgs: HashSet::new(),
            pkg_installed_cache: HashMap::new(),
            remap_config_reload: false,
            traffic_ctl_reload: false,
            sysctl_reload: false,
            observed_status: None,
        })
    }

    /// Full invocation: lock, permission check, git bracketing, the phase
    /// machine, and the warning summary. Returns the process exit code.
    pub async fn run(&mut self) -> i32 {
        info!("trying to acquire app lock");
        let lock = match AppLock::acquire(&self.cfg.lock_path, LOCK_RETRY_INTERVAL, LOCK_RETRY_TIMEOUT)
            .await
        {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                error!(
                    timeout_secs = LOCK_RETRY_TIMEOUT.as_secs(),
                    "failed to get app lock, another instance is running, exiting without running"
                );
                return exit_code::ALREADY_RUNNING;
            }
            Err(e) => {
                error!(error = %e, "acquiring app lock");
                return exit_code::GENERAL_FAILURE;
            }
        };

        if !self.cfg.report_only && !crate::fsutil::is_root() {
            error!("must be run as root to apply configuration");
            return exit_code::USER_CHECK_ERROR;
        }

        if self.cfg.git == GitMode::Yes {
            if let Err(e) = ensure_repo(&self.cfg.ts_config_dir).await {
                error!(error = %e, "ensuring config directory is a git repo");
            }
        }
        if self.cfg.git.enabled() {
            // commit anything someone else changed when we weren't looking
            if let Err(e) = commit_all(&self.cfg.ts_config_dir, false, true).await {
                error!(error = %e, "git committing existing changes");
            }
        }

        let code = self.execute().await;

        self.print_warning_summary();

        if self.cfg.git.enabled() {
            if let Err(e) = commit_all(&self.cfg.ts_config_dir, true, code == exit_code::SUCCESS).await
            {
                error!(error = %e, "git committing applied changes");
            }
        }

        drop(lock);
        if code == exit_code::SUCCESS {
            info!("SUCCESS");
        } else {
            info!("CRITICAL FAILURE, ABORTING");
        }
        code
    }

    /// The phase machine, without process-level concerns. Public so tests
    /// can drive it under an already-held lock.
    pub async fn execute(&mut self) -> i32 {
        let mut syncds_update;

        match self.cfg.files {
            FilesMode::Reval => match self.check_revalidate_state(false).await {
                Ok(UpdateStatus::NotNeeded) => {
                    info!("no revalidation is pending");
                    return exit_code::SUCCESS;
                }
                Ok(status) => syncds_update = status,
                Err(e) => {
                    error!(error = %e, "checking revalidate state");
                    return exit_code::REVALIDATION_ERROR;
                }
            },
            FilesMode::All => {
                match self.check_syncds_state().await {
                    Ok(status) => syncds_update = status,
                    Err(e) => {
                        error!(error = %e, "checking syncds state");
                        return exit_code::SYNCDS_ERROR;
                    }
                }

                if !self.cfg.ignore_update_flag && syncds_update == UpdateStatus::NotNeeded {
                    // no queued work; still honor a maxmind refresh
                    let mut post_config_fail = false;
                    if self.check_maxmind().await {
                        self.remap_config_reload = true;
                        let remap = self.cfg.ts_config_dir.join("remap.config");
                        if let Err(e) = touch(&remap) {
                            error!(error = %e, "failed to touch remap.config for reloading");
                            post_config_fail = true;
                        }
                        if let Err(e) = self.start_services(&mut syncds_update).await {
                            error!(error = %e, "failed to start services");
                            return exit_code::SERVICES_ERROR;
                        }
                    }
                    return if post_config_fail {
                        exit_code::GENERAL_FAILURE
                    } else {
                        exit_code::SUCCESS
                    };
                }
            }
        }

        if self.cfg.files == FilesMode::All {
            info!("======== start processing packages ========");
            if let Err(e) = self.process_packages().await {
                error!(error = %e, "processing packages");
                return exit_code::PACKAGING_ERROR;
            }
            if let Err(e) = self.check_system_services().await {
                error!(error = %e, "verifying system services");
                return exit_code::SERVICES_ERROR;
            }
        } else {
            info!("======== not fetching all files, no package processing needed ========");
        }

        if let Err(e) = self.fetch_config_files().await {
            error!(error = %e, "getting config file list");
            return exit_code::CONFIG_FILES_ERROR;
        }

        match self.process_config_files().await {
            Ok(status) => syncds_update = status,
            Err(e) => error!(error = %e, "processing config files"),
        }

        if self.check_maxmind().await {
            self.remap_config_reload = true;
        }
        if self.remap_config_reload {
            if let Some(remap) = self.config_files.get("remap.config") {
                match touch(&remap.path) {
                    Ok(()) => info!("touched remap.config for reloading"),
                    Err(e) => error!(error = %e, "failed to touch remap.config for reloading"),
                }
            }
        }

        if let Err(e) = self.start_services(&mut syncds_update).await {
            error!(error = %e, "failed to start services");
            return exit_code::SERVICES_ERROR;
        }

        if self.sysctl_reload
            && self.cfg.service_action == ServiceAction::Restart
            && !self.cfg.report_only
        {
            match self.services.run_sysctl().await {
                Ok(()) => debug!("sysctl -p ran successfully"),
                Err(e) => error!(error = %e, "sysctl -p failed"),
            }
        }

        if let Err(e) = self.update_ops(&mut syncds_update).await {
            error!(error = %e, "failed to update Ops");
        }

        exit_code::SUCCESS
    }

    /// Phase 1, reval flavor.
    async fn check_revalidate_state(&mut self, sleep_override: bool) -> Result<UpdateStatus> {
        info!("checking revalidate state");
        if !sleep_override && (self.cfg.report_only || self.cfg.files != FilesMode::Reval) {
            return Ok(UpdateStatus::NotNeeded);
        }

        let server_status = self
            .ops
            .update_status(&self.cfg.host)
            .await
            .context("getting update status")?;
        info!(status = %server_status.status, "my status");

        if !server_status.use_reval_pending {
            error!("separated revalidation is not enabled in Ops, skipping");
            return Ok(UpdateStatus::NotNeeded);
        }

        if !server_status.reval_pending {
            info!("no revalidations are waiting to be applied");
            return Ok(UpdateStatus::NotNeeded);
        }

        let mut update = UpdateStatus::Needed;
        info!("Ops is signaling that a revalidation is waiting to be applied");
        if server_status.parent_reval_pending && self.cfg.wait_for_parents {
            info!("my parents need to revalidate, not revalidating");
            update = UpdateStatus::NotNeeded;
        } else if server_status.parent_reval_pending {
            info!("my parents need to revalidate, but wait-for-parents is false, revalidating anyway");
        }

        if let Err(e) = self.check_status_files(&server_status.status).await {
            error!(error = %e, "checking status files");
        }
        self.observed_status = Some(server_status);
        Ok(update)
    }

    /// Phase 1, full-config flavor.
    async fn check_syncds_state(&mut self) -> Result<UpdateStatus> {
        debug!("checking syncds state");
        let mut update = UpdateStatus::NotNeeded;

        let mut server_status = self
            .ops
            .update_status(&self.cfg.host)
            .await
            .with_context(|| format!("getting '{}' update status", self.cfg.host))?;

        if server_status.update_pending {
            update = UpdateStatus::Needed;
            info!("Ops is signaling that an update is waiting to be applied");

            if server_status.parent_pending && self.cfg.wait_for_parents && !self.cfg.report_only {
                info!("Ops is signaling that my parents need an update");
                let disperse = Duration::from_secs(rand::thread_rng().gen_range(0..3));
                info!(
                    sleep_secs = disperse.as_secs(),
                    "sleeping to see if the update my parents need clears"
                );
                tokio::time::sleep(disperse).await;
                server_status = self.ops.update_status(&self.cfg.host).await?;
                if server_status.parent_pending || server_status.parent_reval_pending {
                    error!("my parents still need an update, bailing");
                    return Ok(UpdateStatus::NotNeeded);
                }
                debug!("the update on my parents cleared, continuing");
            }
        } else if !self.cfg.ignore_update_flag {
            info!("no queued update needs to be applied, running revalidation before exiting");
            if let Err(e) = self.revalidate_while_sleeping().await {
                error!(error = %e, "revalidating while sleeping");
            }
            return Ok(UpdateStatus::NotNeeded);
        } else {
            info!("no update is waiting, but --ignore-update-flag is set, proceeding");
            if server_status.parent_pending && self.cfg.wait_for_parents {
                warn!(
                    "--ignore-update-flag is set while parents are pending and --wait-for-parents is true, proceeding anyway"
                );
            }
        }

        if let Err(e) = self.check_status_files(&server_status.status).await {
            error!(error = %e, "checking status files");
        }
        self.observed_status = Some(server_status);
        Ok(update)
    }

    /// A syncds run with nothing queued still applies any pending
    /// revalidation before exiting.
    async fn revalidate_while_sleeping(&mut self) -> Result<UpdateStatus> {
        let mut update = self.check_revalidate_state(true).await?;
        if update == UpdateStatus::NotNeeded {
            return Ok(update);
        }

        self.cfg.files = FilesMode::Reval;
        self.cfg.wait_for_parents = true;

        self.fetch_config_files().await?;
        update = self.process_config_files().await?;
        self.start_services(&mut update)
            .await
            .context("failed to start services")?;
        if let Err(e) = self.update_ops(&mut update).await {
            error!(error = %e, "failed to update Ops");
        }
        self.traffic_ctl_reload = false;
        Ok(update)
    }

    /// Phase 2: exactly one status marker file, named for the node's
    /// current status; markers for other statuses are removed.
    async fn check_status_files(&mut self, svr_status: &str) -> Result<()> {
        if svr_status.is_empty() {
            bail!("did not find a status from Ops");
        }
        debug!(status = svr_status, "found status from Ops");
        let status_file = self.cfg.status_dir.join(svr_status);

        let statuses = self
            .ops
            .statuses()
            .await
            .context("could not retrieve the statuses list from Ops")?;
        for other in statuses {
            let other_path = self.cfg.status_dir.join(&other);
            if other_path == status_file {
                continue;
            }
            if !self.cfg.report_only && other_path.exists() {
                info!(file = %other_path.display(), "removing stale status file");
                if let Err(e) = std::fs::remove_file(&other_path) {
                    error!(error = %e, file = %other_path.display(), "removing status file");
                }
            }
        }

        if !self.cfg.report_only {
            mkdir_with_owner(&self.cfg.status_dir, FileOwnership::root(0o755))?;
            if !status_file.exists() {
                touch(&status_file)
                    .with_context(|| format!("unable to touch {}", status_file.display()))?;
            }
        }
        Ok(())
    }

    /// Phase 3.
    async fn process_packages(&mut self) -> Result<()> {
        let desired = self
            .ops
            .packages(&self.cfg.host)
            .await
            .context("getting packages")?;
        info!(count = desired.len(), "got package list from Ops");

        let plan = plan_packages(self.packages.as_ref(), &desired).await?;
        for pkg in &plan.satisfied {
            self.pkg_installed_cache.insert(pkg.clone(), true);
        }
        info!(
            install = plan.install.len(),
            uninstall = plan.uninstall.len(),
            "package plan computed"
        );

        if !self.cfg.install_packages {
            for pkg in &plan.install {
                error!(package = %pkg, "is not installed");
            }
            for pkg in &plan.uninstall {
                error!(package = %pkg, "wrong version currently installed");
                self.pkg_installed_cache.insert(pkg.clone(), true);
            }
            return Ok(());
        }

        if self.cfg.report_only {
            if !plan.install.is_empty() {
                for pkg in &plan.install {
                    error!(package = %pkg, "in report mode and package needs installation");
                }
                bail!("in report mode and packages need installation");
            }
            return Ok(());
        }

        let installed = execute_plan(self.packages.as_ref(), &plan).await?;
        for pkg in &installed {
            self.pkg_installed_cache.insert(pkg.clone(), true);
        }
        self.installed_pkgs = installed;
        Ok(())
    }

    /// Installed packages that should also be enabled at boot.
    async fn check_system_services(&mut self) -> Result<()> {
        if self.cfg.service_action != ServiceAction::Restart
            || self.cfg.report_only
            || self.cfg.skip_os_check
        {
            return Ok(());
        }
        self.services
            .enable("trafficserver")
            .await
            .context("unable to enable service trafficserver")?;
        info!("the trafficserver service has been enabled");
        Ok(())
    }

    /// Phase 4a: fetch the generated files and stage them for audit.
    async fn fetch_config_files(&mut self) -> Result<()> {
        let (uid, gid) = ids_of_user(&self.cfg.ats_user).unwrap_or_else(|| {
            error!(user = %self.cfg.ats_user, "could not look up cache owner, using uid/gid 0");
            (0, 0)
        });

        let files = self
            .ops
            .config_files(&self.cfg.host, self.cfg.files == FilesMode::Reval)
            .await
            .context("requesting generated config files")?;

        self.config_files.clear();
        for f in files {
            let mode = if f.secure { 0o600 } else { 0o644 };
            let dir = PathBuf::from(&f.path);
            let path = dir.join(&f.name);
            for w in &f.warnings {
                if !w.is_empty() {
                    self.warn(&f.name, w.clone());
                }
            }
            self.config_files.insert(
                f.name.clone(),
                ConfigFileState {
                    name: f.name,
                    dir,
                    path,
                    body: f.text.into_bytes(),
                    uid,
                    gid,
                    mode,
                    service: String::new(),
                    audit_complete: false,
                    audit_failed: false,
                    prereq_failed: false,
                    change_needed: false,
                    change_applied: false,
                },
            );
        }
        info!(count = self.config_files.len(), "staged generated config files");
        Ok(())
    }

    /// Phases 4b and 5.
    pub async fn process_config_files(&mut self) -> Result<UpdateStatus> {
        info!("======== start processing config files ========");
        let files_adding: HashSet<String> = self.config_files.keys().cloned().collect();
        let mut names: Vec<String> = self.config_files.keys().cloned().collect();
        names.sort();

        for name in &names {
            self.classify_service(name);
            let service = self
                .config_files
                .get(name)
                .map(|f| f.service.clone())
                .unwrap_or_default();
            if service == "trafficserver"
                && !self.cfg.install_packages
                && !self.is_package_installed("trafficserver").await
            {
                error!("not installing packages, but trafficserver isn't installed, continuing");
            }
            debug!(file = %name, service = %service, "about to process config file");
            if let Err(e) = self.audit_file(name, &files_adding) {
                error!(file = %name, error = %e, "audit failed");
            }
        }

        let mut update = UpdateStatus::NotNeeded;
        let mut changes_required = 0;

        for name in &names {
            let Some(file) = self.config_files.get(name) else { continue };
            let ready = file.change_needed
                && !file.change_applied
                && file.audit_complete
                && !file.prereq_failed
                && !file.audit_failed;
            if !ready {
                continue;
            }
            changes_required += 1;

            let peer_prereq_failed = |other: &str, files: &HashMap<String, ConfigFileState>| {
                files.get(other).map(|f| f.prereq_failed).unwrap_or(false)
            };
            if name == "plugin.config" && peer_prereq_failed("remap.config", &self.config_files) {
                update = UpdateStatus::Failed;
                error!("plugin.config changed but prereqs failed for remap.config, skipping plugin.config");
                continue;
            }
            if name == "remap.config" && peer_prereq_failed("plugin.config", &self.config_files) {
                update = UpdateStatus::Failed;
                error!("remap.config changed but prereqs failed for plugin.config, skipping remap.config");
                continue;
            }
            if name == "ip_allow.config" && !self.cfg.update_ip_allow {
                warn!("ip_allow.config changed, not updating! Run with --syncds-updates-ipallow=true to update");
                continue;
            }

            debug!(file = %name, "all prereqs passed, replacing on disk");
            if let Err(e) = self.replace_file(name) {
                error!(file = %name, error = %e, "failed to replace config file on disk");
            }
        }

        if !self.changed_files.is_empty() {
            info!(
                remap_reload = self.remap_config_reload,
                traffic_ctl_reload = self.traffic_ctl_reload,
                sysctl = self.sysctl_reload,
                "final reload state"
            );
        }

        if update != UpdateStatus::Failed && changes_required > 0 {
            return Ok(UpdateStatus::Needed);
        }
        Ok(update)
    }

    fn classify_service(&mut self, name: &str) {
        let Some(file) = self.config_files.get_mut(name) else { return };
        let path = file.path.to_string_lossy().to_string();
        let dir = file.dir.to_string_lossy().to_string();
        file.service = if path.contains("/opt/trafficserver/") || dir.contains("udev") {
            "trafficserver"
        } else if path.contains("cron") || name == "sysctl.conf" || name == "50-ats.rules" {
            "system"
        } else if path.contains("ntp.conf") {
            "ntpd"
        } else {
            "unknown"
        }
        .to_string();
    }

    /// Phase 4b for one file: directory, file-specific audits, diff.
    fn audit_file(&mut self, name: &str, files_adding: &HashSet<String>) -> Result<()> {
        let (dir, path, uid, gid, mut body, audit_complete) = {
            let file = self.config_files.get(name).context("unknown config file")?;
            (
                file.dir.clone(),
                file.path.clone(),
                file.uid,
                file.gid,
                file.body.clone(),
                file.audit_complete,
            )
        };
        if audit_complete {
            return Ok(());
        }
        if name.is_empty() || dir.as_os_str().is_empty() {
            if let Some(file) = self.config_files.get_mut(name) {
                file.audit_failed = true;
            }
            bail!("config file has no name or location, skipping further checks");
        }

        mkdir_with_owner(&dir, FileOwnership { uid, gid, mode: 0o755 })
            .with_context(|| format!("unable to create the directory {}", dir.display()))?;

        if name == "remap.config" {
            let text = String::from_utf8_lossy(&body).into_owned();
            match process_remap_overrides(&text) {
                Ok(rewritten) => body = rewritten.into_bytes(),
                Err(e) => {
                    if let Some(file) = self.config_files.get_mut(name) {
                        file.audit_failed = true;
                    }
                    return Err(e);
                }
            }
        }

        if name == "remap.config" || name == "plugin.config" {
            let mut checker = RefsChecker::new(RefsConfig {
                plugin_dir: self.cfg.ts_plugin_dir.clone(),
                config_dir: self.cfg.ts_config_dir.clone(),
            });
            let text = String::from_utf8_lossy(&body).into_owned();
            let failures = checker.check_config(&text, files_adding);
            if failures > 0 {
                let msg = format!("failed to verify '{name}': {failures} references missing");
                self.warn(name, msg.clone());
                if let Some(file) = self.config_files.get_mut(name) {
                    file.prereq_failed = true;
                }
                bail!(msg);
            }
            info!(file = %name, "successfully verified plugin references");
        }

        if name.ends_with(".cer") {
            for w in check_cert(&body) {
                self.warn(name, w);
            }
        }

        if name == "50-ats.rules" {
            let text = String::from_utf8_lossy(&body).into_owned();
            for w in process_udev_rules(&text, &self.cfg.dev_dir) {
                self.warn(name, w);
            }
        }

        let change_needed = files_differ(&body, &path).context("getting diff")?;
        if let Some(file) = self.config_files.get_mut(name) {
            file.body = body;
            file.change_needed = change_needed;
            file.audit_complete = true;
        }
        debug!(file = %name, change_needed, "audit complete");
        Ok(())
    }

    /// Phase 5 for one file: atomic write and restart-state bookkeeping.
    fn replace_file(&mut self, name: &str) -> Result<()> {
        if self.cfg.report_only {
            info!(file = %name, "report mode, not replacing file with the generated version");
            return Ok(());
        }
        let Some(file) = self.config_files.get_mut(name) else {
            bail!("unknown config file {name}");
        };

        atomic_write(
            &file.path,
            &file.body,
            FileOwnership { uid: file.uid, gid: file.gid, mode: file.mode },
        )?;
        file.change_applied = true;
        let path = file.path.to_string_lossy().to_string();
        let dir = file.dir.to_string_lossy().to_string();
        self.changed_files.push(path);

        let remap_adjacent = REMAP_ADJACENT_PREFIXES.iter().any(|p| name.starts_with(p))
            || name.ends_with(".lua")
            || name == "remap.config";
        let ssl_material =
            dir.ends_with("ssl") && (name.ends_with(".cer") || name.ends_with(".key"));
        let reload = dir.ends_with("trafficserver")
            || remap_adjacent
            || ssl_material
            || name == "ssl_multicert.config"
            || name == "records.config";

        self.remap_config_reload |= remap_adjacent;
        self.traffic_ctl_reload |= reload;
        self.sysctl_reload |= name == "sysctl.conf";

        debug!(file = %name, reload, remap_adjacent, "change applied");
        Ok(())
    }

    async fn is_package_installed(&mut self, name: &str) -> bool {
        for (pkg, installed) in &self.pkg_installed_cache {
            if pkg.starts_with(name) {
                return *installed;
            }
        }
        match self.packages.installed(name).await {
            Ok(list) if !list.is_empty() => {
                self.pkg_installed_cache.insert(list[0].clone(), true);
                true
            }
            Ok(_) => {
                self.pkg_installed_cache.insert(name.to_string(), false);
                false
            }
            Err(e) => {
                error!(package = name, error = %e, "querying package database");
                self.pkg_installed_cache.insert(name.to_string(), false);
                false
            }
        }
    }

    /// Phases 6 and 7.
    pub async fn start_services(&mut self, update: &mut UpdateStatus) -> Result<()> {
        let installed: Vec<String> = self.installed_pkgs.iter().cloned().collect();
        let mut needs = if self.cfg.service_action == ServiceAction::Restart {
            ServiceNeeds::Restart
        } else {
            classify(&self.changed_files, &installed)
        };
        info!(needs = needs.as_str(), "transition classification");

        if needs == ServiceNeeds::Nothing && (self.traffic_ctl_reload || self.remap_config_reload) {
            info!("config files unchanged, but files were updated out of band, needs reload");
            needs = ServiceNeeds::Reload;
        }

        if needs != ServiceNeeds::Nothing && !self.is_package_installed("trafficserver").await {
            bail!("trafficserver {} but is not installed", needs.as_str());
        }

        if self.cfg.report_only {
            match needs {
                ServiceNeeds::Restart => error!(
                    "configuration has changed, the new config will be picked up the next time the service is started"
                ),
                ServiceNeeds::Reload => {
                    error!("configuration has changed, 'traffic_ctl config reload' needs to be run")
                }
                ServiceNeeds::Nothing => {}
            }
            return Ok(());
        }

        match self.cfg.service_action {
            ServiceAction::None => Ok(()),
            ServiceAction::Restart => {
                let status = self
                    .services
                    .status("trafficserver")
                    .await
                    .context("getting trafficserver service status")?;
                if status == SvcStatus::Running {
                    self.services
                        .restart("trafficserver")
                        .await
                        .context("failed to restart trafficserver")?;
                    info!("trafficserver has been restarted");
                } else {
                    self.services
                        .start("trafficserver")
                        .await
                        .context("failed to start trafficserver")?;
                    info!("trafficserver has been started");
                }
                if *update == UpdateStatus::Needed {
                    *update = UpdateStatus::Successful;
                }
                Ok(())
            }
            ServiceAction::Reload => {
                match needs {
                    ServiceNeeds::Restart => {
                        error!(
                            "configuration requires a restart, the new config will be picked up the next time the service is started"
                        );
                    }
                    ServiceNeeds::Reload => {
                        info!("configuration has changed, running 'traffic_ctl config reload' now");
                        if let Err(e) = self.services.reload_config().await {
                            if *update == UpdateStatus::Needed {
                                *update = UpdateStatus::Failed;
                            }
                            return Err(e).context(
                                "configuration changed and 'traffic_ctl config reload' failed, check the cache logs",
                            );
                        }
                        info!("'traffic_ctl config reload' was successful");
                    }
                    ServiceNeeds::Nothing => {}
                }
                if *update == UpdateStatus::Needed {
                    *update = UpdateStatus::Successful;
                }
                Ok(())
            }
        }
    }

    /// Phase 8.
    async fn check_maxmind(&mut self) -> bool {
        let Some(url) = self.cfg.maxmind_location.clone() else {
            info!("maxmind location is empty, not checking for a database update");
            return false;
        };
        match check_maxmind_update(&url, &self.cfg.ts_config_dir, &self.http).await {
            Ok(true) => {
                info!(url = %url, "maxmind database was updated");
                true
            }
            Ok(false) => {
                info!("maxmind database not updated, not needed or not modified");
                false
            }
            Err(e) => {
                error!(error = %e, "maxmind update check failed");
                false
            }
        }
    }

    /// Phase 9.
    pub async fn update_ops(&mut self, update: &mut UpdateStatus) -> Result<()> {
        let server_status = self
            .ops
            .update_status(&self.cfg.host)
            .await
            .context("failed to update Ops")?;

        let perform = match *update {
            UpdateStatus::NotNeeded
                if server_status.update_pending || server_status.reval_pending =>
            {
                error!(
                    "Ops is signaling an update is ready to be applied, but none was found; clearing update state anyway"
                );
                true
            }
            UpdateStatus::NotNeeded => {
                info!("Ops does not require an update at this time");
                return Ok(());
            }
            UpdateStatus::Failed => {
                error!(
                    "Ops requires an update but applying it locally failed; Ops is not being updated"
                );
                return Ok(());
            }
            UpdateStatus::Successful => {
                info!("update applied successfully, clearing update state in Ops");
                true
            }
            UpdateStatus::Needed => false,
        };
        if !perform {
            return Ok(());
        }

        if self.cfg.report_only {
            error!("in report mode and Ops needs updating, you should probably do that manually");
            return Ok(());
        }
        if self.cfg.no_unset_update_flag {
            return Ok(());
        }

        // carry the update times observed before this run so Ops can
        // detect a queue that raced with us
        let observed = self.observed_status.as_ref().unwrap_or(&server_status);
        match self.cfg.files {
            FilesMode::All => {
                self.ops
                    .clear_update_pending(&self.cfg.host, observed.config_update_time)
                    .await
                    .context("Ops update failed")?;
            }
            FilesMode::Reval => {
                self.ops
                    .clear_reval_pending(&self.cfg.host, observed.revalidate_update_time)
                    .await
                    .context("Ops update failed")?;
            }
        }
        info!("Ops has been updated");
        Ok(())
    }

    fn warn(&mut self, file: &str, msg: String) {
        self.warnings.entry(file.to_string()).or_default().push(msg);
    }

    /// Printed at exit regardless of outcome.
    pub fn print_warning_summary(&self) {
        info!("======== summary of config warnings that may need attention ========");
        for (file, warnings) in &self.warnings {
            for warning in warnings {
                warn!(file = %file, "{warning}");
            }
        }
        info!("======== end warning summary ========");
    }

    pub fn changed_files(&self) -> &[String] {
        &self.changed_files
    }
}
