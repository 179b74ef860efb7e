//! Node-local health client
//!
//! Reads the combined availability view from a monitor and marks this
//! cache's parents up or down through the control CLI, with hysteresis.

use agent_lib::parent::{spawn_sighup_listener, ParentSupervisor, TrafficCtl};
use agent_lib::OpsClient;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LOGIN_ATTEMPTS: u32 = 5;

const EXIT_CONFIG_ERROR: i32 = 166;
const EXIT_RUNTIME_ERROR: i32 = 167;

#[derive(Parser)]
#[command(name = "cache-health-client", version, about = "Parent availability controller")]
struct Cli {
    /// Static configuration file
    #[arg(long, short, default_value = "/etc/cache-health-client/config.json")]
    config: PathBuf,

    /// PID file path
    #[arg(long, default_value = "/run/cache-health-client.pid")]
    pid_file: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let file = match config::load_file(&cli.config) {
        Ok(f) => f,
        Err(e) => {
            error!(error = %e, "loading configuration");
            return EXIT_CONFIG_ERROR;
        }
    };
    let creds = match config::load_credentials(&file.credentials_file) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "loading credentials");
            return EXIT_CONFIG_ERROR;
        }
    };
    let parent_cfg = file.parent_config();
    info!(
        poll_interval_secs = parent_cfg.poll_interval.as_secs(),
        cdn = %parent_cfg.cdn,
        "configured"
    );

    let source = match config::FileConfigSource::new(cli.config.clone(), file.credentials_file.clone())
    {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "tracking configuration files");
            return EXIT_CONFIG_ERROR;
        }
    };

    let ops = match OpsClient::connect(file.ops_config(&creds), LOGIN_ATTEMPTS).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "establishing Ops session");
            return EXIT_RUNTIME_ERROR;
        }
    };

    let ctl = Arc::new(TrafficCtl::new(parent_cfg.trafficserver_bin_dir.clone()));
    let mut supervisor = match ParentSupervisor::new(parent_cfg, ops, ctl, source).await {
        Ok(s) => s,
        Err(e) => {
            error!(
                error = %e,
                "startup could not initialize parent info, check that trafficserver is running"
            );
            return EXIT_RUNTIME_ERROR;
        }
    };

    // learn the usable monitors before the first poll
    supervisor.refresh_monitors().await;

    if let Err(e) = std::fs::write(&cli.pid_file, std::process::id().to_string()) {
        error!(error = %e, path = %cli.pid_file.display(), "could not write the pid file");
        return EXIT_RUNTIME_ERROR;
    }

    if let Err(e) = spawn_sighup_listener(supervisor.reload_flag()) {
        error!(error = %e, "installing SIGHUP handler");
        return EXIT_RUNTIME_ERROR;
    }

    info!(version = VERSION, "startup complete");
    supervisor.run().await;
    0
}
