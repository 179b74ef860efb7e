//! Desired-state enroller
//!
//! Ingests queued JSON documents through a directory watcher and an HTTP
//! endpoint and submits them to Ops in dependency order. Creates are
//! idempotent, so the initial load can be replayed safely.

use agent_lib::enroll::{DirWatcher, Dispatcher, WatchConfig};
use agent_lib::health::{components, HealthRegistry};
use agent_lib::observability::Metrics;
use agent_lib::OpsClient;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LOGIN_ATTEMPTS: u32 = 10;

#[derive(Parser)]
#[command(name = "cache-enroller", version, about = "Desired-state enroller")]
struct Cli {
    /// Path to a JSON config file; the environment overrides it
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let mut cfg = config::EnrollerConfig::load(cli.config.as_deref())?;
    if cfg.watch_dir.is_empty() && cfg.http_port == 0 {
        // with neither front-end configured, watch the current directory
        cfg.watch_dir = ".".to_string();
    }
    info!(version = VERSION, watch_dir = %cfg.watch_dir, http_port = cfg.http_port, "starting cache-enroller");

    let health = HealthRegistry::new();
    health.register(components::OPS_SESSION).await;

    info!("starting Ops session");
    let ops = OpsClient::connect(cfg.ops_config(), LOGIN_ATTEMPTS)
        .await
        .context("establishing Ops session")?;
    info!("Ops session established");
    health.set_healthy(components::OPS_SESSION).await;

    let metrics = Metrics::new();
    let dispatcher = Arc::new(Dispatcher::new(ops));

    let mut watcher_handle = None;
    if !cfg.watch_dir.is_empty() {
        health.register(components::WATCHER).await;
        let watcher = Arc::new(DirWatcher::new(
            dispatcher.clone(),
            WatchConfig::new(&cfg.watch_dir),
        ));
        match watcher.clone().start() {
            Ok(handle) => {
                info!(dir = %cfg.watch_dir, "watching directory");
                health.set_healthy(components::WATCHER).await;
                watcher_handle = Some(handle);
                // drain anything queued before we were running
                watcher.sweep_existing().await;
            }
            Err(e) => {
                error!(error = %e, dir = %cfg.watch_dir, "dirwatcher failed");
                health.set_unhealthy(components::WATCHER, e.to_string()).await;
            }
        }
    }

    let mut api_task = None;
    if cfg.http_port != 0 {
        health.register(components::INGEST).await;
        let state = api::AppState {
            dispatcher: dispatcher.clone(),
            health: health.clone(),
            metrics: metrics.clone(),
        };
        api_task = Some(tokio::spawn(api::serve(cfg.http_port, state)));
        health.set_healthy(components::INGEST).await;
    }

    // signal downstream consumers that initial loads may begin
    std::fs::File::create(&cfg.started_file)
        .with_context(|| format!("creating {}", cfg.started_file.display()))?;
    info!(file = %cfg.started_file.display(), "created readiness marker");
    health.set_ready(true).await;

    match api_task {
        Some(task) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
                result = task => error!(?result, "http ingest exited"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("SIGINT received, shutting down");
        }
    }

    drop(watcher_handle);
    Ok(())
}
