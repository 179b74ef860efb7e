//! Apply the desired configuration to this cache node

use agent_lib::reconcile::{
    exit_code, ApplyConfig, FilesMode, GitMode, Reconciler, Rpm, ServiceAction, SystemService,
};
use agent_lib::{OpsClient, OpsConfig};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cache-agent-apply", version, about = "Generate and apply cache configuration")]
struct Cli {
    /// Which files to consider: all or reval
    #[arg(long, default_value = "all")]
    files: String,

    /// What the run may do to the service: none, reload, or restart
    #[arg(long = "service-action", default_value = "none")]
    service_action: String,

    /// Log changes without applying anything
    #[arg(long = "report-only")]
    report_only: bool,

    /// Install and remove packages to match Ops
    #[arg(long = "install-packages")]
    install_packages: bool,

    /// Do not apply while parents still have an update pending
    #[arg(long = "wait-for-parents")]
    wait_for_parents: bool,

    /// Apply even when no update is pending
    #[arg(long = "ignore-update-flag")]
    ignore_update_flag: bool,

    /// Leave the update-pending flag set in Ops
    #[arg(long = "no-unset-update-flag")]
    no_unset_update_flag: bool,

    /// Keep config history in git: yes, auto, or no
    #[arg(long, default_value = "auto")]
    git: String,

    /// URL of a gzipped maxmind database to keep fresh
    #[arg(long = "maxmind-location")]
    maxmind_location: Option<String>,

    /// Allow updates to ip_allow.config during a syncds run
    #[arg(long = "syncds-updates-ipallow")]
    syncds_updates_ipallow: bool,

    /// Skip OS service-management checks
    #[arg(long = "skip-os-check")]
    skip_os_check: bool,

    /// This node's host name in Ops
    #[arg(long, env = "CACHE_AGENT_HOST")]
    cache_host_name: String,

    /// Ops base URL
    #[arg(long = "ops-url", env = "CACHE_AGENT_OPS_URL")]
    ops_url: String,

    /// Ops user
    #[arg(long = "ops-user", env = "CACHE_AGENT_OPS_USER")]
    ops_user: String,

    /// Ops password
    #[arg(long = "ops-password", env = "CACHE_AGENT_OPS_PASSWORD")]
    ops_password: String,

    /// Trafficserver config directory
    #[arg(long = "ts-config-dir", default_value = "/opt/trafficserver/etc/trafficserver")]
    ts_config_dir: PathBuf,

    /// Trafficserver plugin directory
    #[arg(long = "ts-plugin-dir", default_value = "/opt/trafficserver/libexec/trafficserver")]
    ts_plugin_dir: PathBuf,

    /// Trafficserver bin directory
    #[arg(long = "ts-bin-dir", default_value = "/opt/trafficserver/bin")]
    ts_bin_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let files = match cli.files.parse::<FilesMode>() {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "bad --files");
            return exit_code::CONFIG_ERROR;
        }
    };
    let service_action = match cli.service_action.parse::<ServiceAction>() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "bad --service-action");
            return exit_code::CONFIG_ERROR;
        }
    };

    let mut cfg = ApplyConfig::new(&cli.cache_host_name);
    cfg.files = files;
    cfg.service_action = service_action;
    cfg.report_only = cli.report_only;
    cfg.install_packages = cli.install_packages;
    cfg.wait_for_parents = cli.wait_for_parents;
    cfg.ignore_update_flag = cli.ignore_update_flag;
    cfg.no_unset_update_flag = cli.no_unset_update_flag;
    cfg.git = GitMode::parse(&cli.git);
    cfg.maxmind_location = cli.maxmind_location.clone();
    cfg.update_ip_allow = cli.syncds_updates_ipallow;
    cfg.skip_os_check = cli.skip_os_check;
    cfg.ts_config_dir = cli.ts_config_dir.clone();
    cfg.ts_plugin_dir = cli.ts_plugin_dir.clone();
    cfg.ts_bin_dir = cli.ts_bin_dir.clone();

    let ops_cfg = OpsConfig {
        url: cli.ops_url.clone(),
        user: cli.ops_user.clone(),
        password: cli.ops_password.clone(),
        api_version: "4.0".to_string(),
        timeout_secs: 60,
        initial_backoff_secs: 1,
        max_backoff_secs: 60,
    };
    let ops = match OpsClient::connect(ops_cfg, 5).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "establishing Ops session");
            return exit_code::GENERAL_FAILURE;
        }
    };

    let services = Arc::new(SystemService::new(cli.ts_bin_dir));
    let mut reconciler = match Reconciler::new(cfg, ops, Arc::new(Rpm), services) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "initializing");
            return exit_code::GENERAL_FAILURE;
        }
    };
    reconciler.run().await
}
