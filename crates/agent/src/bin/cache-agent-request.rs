//! Fetch Ops data for this node and print it as JSON
//!
//! The same data the apply flow consumes, exposed for operators and
//! scripts: update status, package list, statuses, monitors, and the
//! generated config file set.

use agent_lib::{OpsClient, OpsConfig};
use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cache-agent-request", version, about = "Request Ops data")]
struct Cli {
    /// What to fetch: update-status, packages, statuses, monitors, or
    /// config-files
    #[arg(long = "get-data", default_value = "update-status")]
    get_data: String,

    /// This node's host name in Ops
    #[arg(long, env = "CACHE_AGENT_HOST")]
    cache_host_name: String,

    /// CDN name, required for monitors
    #[arg(long, env = "CACHE_AGENT_CDN", default_value = "")]
    cdn: String,

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
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
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
            return 1;
        }
    };

    let data = match cli.get_data.as_str() {
        "update-status" => ops
            .update_status(&cli.cache_host_name)
            .await
            .and_then(|s| Ok(serde_json::to_value(s)?)),
        "packages" => ops
            .packages(&cli.cache_host_name)
            .await
            .and_then(|p| Ok(serde_json::to_value(p)?)),
        "statuses" => ops.statuses().await.and_then(|s| Ok(serde_json::to_value(s)?)),
        "monitors" => ops.monitors(&cli.cdn).await.and_then(|m| Ok(serde_json::to_value(m)?)),
        "config-files" => ops
            .config_files(&cli.cache_host_name, false)
            .await
            .and_then(|f| Ok(serde_json::to_value(f)?)),
        other => {
            error!(what = other, "unknown --get-data value");
            return 1;
        }
    };

    match data {
        Ok(value) => {
            println!("{value:#}");
            0
        }
        Err(e) => {
            error!(error = %e, what = %cli.get_data, "fetching data");
            1
        }
    }
}
