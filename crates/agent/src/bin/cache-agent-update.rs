//! Clear a cache's update or reval pending flag in Ops

use agent_lib::{OpsClient, OpsConfig};
use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "cache-agent-update",
    version,
    about = "Update a cache's queue and reval status in Ops"
)]
struct Cli {
    /// This node's host name in Ops
    #[arg(long, env = "CACHE_AGENT_HOST")]
    cache_host_name: String,

    /// Clear the config-update-pending flag
    #[arg(long = "clear-update")]
    clear_update: bool,

    /// Clear the revalidate-pending flag
    #[arg(long = "clear-reval")]
    clear_reval: bool,

    /// Ops base URL
    #[arg(long = "ops-url", env = "CACHE_AGENT_OPS_URL")]
    ops_url: String,

    #[arg(long = "ops-user", env = "CACHE_AGENT_OPS_USER")]
    ops_user: String,

    #[arg(long = "ops-password", env = "CACHE_AGENT_OPS_PASSWORD")]
    ops_password: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if !cli.clear_update && !cli.clear_reval {
        eprintln!("nothing to do: pass --clear-update and/or --clear-reval");
        std::process::exit(1);
    }

    let ops_cfg = OpsConfig {
        url: cli.ops_url.clone(),
        user: cli.ops_user.clone(),
        password: cli.ops_password.clone(),
        api_version: "4.0".to_string(),
        timeout_secs: 30,
        initial_backoff_secs: 1,
        max_backoff_secs: 60,
    };
    let ops = match OpsClient::connect(ops_cfg, 3).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "establishing Ops session");
            std::process::exit(1);
        }
    };

    // carry the currently observed times so Ops can detect a concurrent queue
    let status = match ops.update_status(&cli.cache_host_name).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "getting update status");
            std::process::exit(1);
        }
    };

    if cli.clear_update {
        if let Err(e) = ops
            .clear_update_pending(&cli.cache_host_name, status.config_update_time)
            .await
        {
            error!(error = %e, "clearing update flag");
            std::process::exit(1);
        }
    }
    if cli.clear_reval {
        if let Err(e) = ops
            .clear_reval_pending(&cli.cache_host_name, status.revalidate_update_time)
            .await
        {
            error!(error = %e, "clearing reval flag");
            std::process::exit(1);
        }
    }
}
