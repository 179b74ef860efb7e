//! Health monitor daemon
//!
//! Polls the CDN's caches and peer monitors, combines opinions into the
//! authoritative availability view, and publishes it at
//! `/publish/CrStates`.

use agent_lib::health::{components, HealthRegistry};
use agent_lib::monitor::{derive_probe_sets, Combiner, ConfigPoller, EventLog};
use agent_lib::observability::Metrics;
use agent_lib::poller::{HttpProber, PollingEngine, PollingFamily};
use agent_lib::OpsClient;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LOGIN_ATTEMPTS: u32 = 10;

#[derive(Parser)]
#[command(name = "cache-monitor", version, about = "CDN health monitor daemon")]
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
    let cfg = config::MonitorConfig::load(cli.config.as_deref())?;
    info!(version = VERSION, hostname = %cfg.hostname, cdn = %cfg.cdn, "starting cache-monitor");

    let health = HealthRegistry::new();
    for c in [
        components::CONFIG_POLLER,
        components::CACHE_POLLER,
        components::PEER_POLLER,
        components::COMBINER,
        components::OPS_SESSION,
    ] {
        health.register(c).await;
    }
    let metrics = Metrics::new();

    let ops = OpsClient::connect(cfg.ops_config(), LOGIN_ATTEMPTS)
        .await
        .context("establishing Ops session")?;
    health.set_healthy(components::OPS_SESSION).await;

    let config_interval = Duration::from_secs(cfg.config_poll_interval_secs);
    let (config_poller, config_handle) = ConfigPoller::new(cfg.cdn.clone(), config_interval);
    config_handle
        .session_tx
        .send(ops.clone())
        .await
        .ok()
        .context("seeding config poller session")?;
    tokio::spawn(config_poller.run());

    let (events_tx, mut events_rx) = mpsc::channel(256);
    let (combiner, combiner_handle) =
        Combiner::new(cfg.peer_optimistic_quorum_min, config_interval, events_tx);

    let (cache_tx, cache_rx) = mpsc::channel(64);
    let (peer_tx, peer_rx) = mpsc::channel(64);
    tokio::spawn(combiner.run(cache_rx, peer_rx));

    let event_log = Arc::new(Mutex::new(EventLog::new(cfg.max_events)));
    {
        let event_log = event_log.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                info!(
                    cache = %event.name,
                    available = event.available,
                    description = %event.description,
                    "availability transition"
                );
                metrics.inc_transition(event.available);
                if let Ok(mut log) = event_log.lock() {
                    log.add(event);
                }
            }
        });
    }

    // reconfigure the probe engines whenever a fresh snapshot arrives
    let family = PollingFamily::parse(&cfg.polling_family);
    let self_name = cfg.hostname.clone();
    let mut snapshot_rx = config_handle.snapshot_rx.clone();
    let staleness_tx = combiner_handle.staleness_tx.clone();
    let reconfigure_health = health.clone();
    let reconfigure_metrics = metrics.clone();
    tokio::spawn(async move {
        let user_agent = format!("cache-monitor/{VERSION}");
        let prober = match HttpProber::new(&user_agent, Duration::from_secs(2)) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                error!(error = %e, "building probe client");
                return;
            }
        };
        let mut cache_engine = PollingEngine::new(prober.clone(), cache_tx);
        let mut peer_engine = PollingEngine::new(prober, peer_tx);

        while snapshot_rx.changed().await.is_ok() {
            let snapshot = snapshot_rx.borrow_and_update().clone();
            let Some(snapshot) = snapshot else { continue };

            let (cache_set, peer_set) = derive_probe_sets(&snapshot, family, &self_name);
            let staleness = peer_set.interval;
            let total = cache_set.probes.len() + peer_set.probes.len();
            info!(
                caches = cache_set.probes.len(),
                peers = peer_set.probes.len(),
                "applying monitoring snapshot"
            );
            cache_engine.reconfigure(cache_set);
            peer_engine.reconfigure(peer_set);
            reconfigure_metrics.set_probes_running(total as i64);
            if staleness_tx.send(staleness).await.is_err() {
                warn!("combiner gone, stopping reconfiguration");
                return;
            }
            reconfigure_health.set_healthy(components::CACHE_POLLER).await;
            reconfigure_health.set_healthy(components::PEER_POLLER).await;
        }
    });

    // SIGHUP re-reads the config file and retargets the poll interval
    if let Some(config_path) = cli.config.clone() {
        let interval_tx = config_handle.interval_tx.clone();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(mut hup) => {
                tokio::spawn(async move {
                    while hup.recv().await.is_some() {
                        info!("SIGHUP received, re-reading configuration");
                        match config::MonitorConfig::load(Some(&config_path)) {
                            Ok(fresh) => {
                                let interval =
                                    Duration::from_secs(fresh.config_poll_interval_secs);
                                if interval_tx.send(interval).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => error!(error = %e, "re-reading configuration"),
                        }
                    }
                });
            }
            Err(e) => error!(error = %e, "installing SIGHUP handler"),
        }
    }

    health.set_ready(true).await;
    let state = api::AppState {
        health: health.clone(),
        combined_rx: combiner_handle.combined_rx.clone(),
        events: event_log,
    };
    let api = tokio::spawn(api::serve(cfg.api_port, state));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
        result = api => {
            error!(?result, "publish API exited");
        }
    }
    Ok(())
}
