//! Monitoring config polling and probe-set derivation

use crate::models::MonitoringSnapshot;
use crate::ops::OpsClient;
use crate::poller::{PollingFamily, Probe, ProbeKind, ProbeSet, ProbeTarget};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Periodically fetches the monitoring config and the routing snapshot for
/// one CDN and publishes the latest monitoring snapshot.
///
/// Publication is latest-wins: a reader always observes the freshest
/// snapshot and intermediate ones are dropped, never queued. The poller
/// itself never blocks on slow readers.
pub struct ConfigPoller {
    cdn: String,
    session: Option<OpsClient>,
    interval: Duration,
    interval_rx: mpsc::Receiver<Duration>,
    session_rx: mpsc::Receiver<OpsClient>,
    publish: watch::Sender<Option<MonitoringSnapshot>>,
}

/// Caller-side handle: change the interval or the session, and read the
/// latest published snapshot.
#[derive(Clone)]
pub struct ConfigPollerHandle {
    pub interval_tx: mpsc::Sender<Duration>,
    pub session_tx: mpsc::Sender<OpsClient>,
    pub snapshot_rx: watch::Receiver<Option<MonitoringSnapshot>>,
}

impl ConfigPoller {
    pub fn new(cdn: impl Into<String>, interval: Duration) -> (Self, ConfigPollerHandle) {
        let (interval_tx, interval_rx) = mpsc::channel(1);
        let (session_tx, session_rx) = mpsc::channel(1);
        let (publish, snapshot_rx) = watch::channel(None);
        (
            Self {
                cdn: cdn.into(),
                session: None,
                interval,
                interval_rx,
                session_rx,
                publish,
            },
            ConfigPollerHandle { interval_tx, session_tx, snapshot_rx },
        )
    }

    /// Run until every handle is dropped.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(cdn = %self.cdn, interval_secs = self.interval.as_secs(), "config poller started");

        loop {
            tokio::select! {
                Some(session) = self.session_rx.recv() => {
                    info!("config poller received new Ops session");
                    self.session = Some(session);
                }
                Some(interval) = self.interval_rx.recv() => {
                    if interval == self.interval {
                        continue;
                    }
                    if interval.is_zero() {
                        warn!("config poller ignoring zero interval");
                        continue;
                    }
                    info!(interval_secs = interval.as_secs(), "config poller interval changed");
                    self.interval = interval;
                    tick = tokio::time::interval(self.interval);
                    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                }
                _ = tick.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    async fn poll_once(&mut self) {
        let Some(session) = self.session.as_ref() else {
            warn!("config poller skipping this iteration, session is unset");
            return;
        };
        if self.cdn.is_empty() {
            warn!("config poller skipping this iteration, CDN name is unset");
            return;
        }

        let snapshot = match session.monitoring_config(&self.cdn).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "fetching monitoring config");
                return;
            }
        };

        // fetch the routing snapshot alongside, so the two documents a
        // reader sees were taken from the same poll
        if let Err(e) = session.routing_config(&self.cdn).await {
            warn!(error = %e, "fetching routing config");
            return;
        }

        debug!(
            caches = snapshot.traffic_servers.len(),
            peers = snapshot.traffic_monitors.len(),
            "publishing monitoring snapshot"
        );
        self.publish.send_replace(Some(snapshot));
    }
}

/// Statuses of caches and monitors that should be polled.
fn polled(status: &str) -> bool {
    status == "REPORTED" || status == "ONLINE" || status == "ADMIN_DOWN"
}

/// Derive the cache and peer probe sets from a monitoring snapshot.
///
/// `self_name` is this monitor's own host name; it is excluded from the
/// peer set.
pub fn derive_probe_sets(
    snap: &MonitoringSnapshot,
    family: PollingFamily,
    self_name: &str,
) -> (ProbeSet, ProbeSet) {
    let timeout = Duration::from_millis(snap.config.health_connection_timeout_ms);
    let format = snap.config.health_polling_format.clone();

    let mut caches = ProbeSet {
        interval: Duration::from_millis(snap.config.health_polling_interval_ms),
        family,
        ..ProbeSet::default()
    };
    for server in &snap.traffic_servers {
        if !polled(&server.status) {
            continue;
        }
        let url = if server.ip.is_empty() {
            String::new()
        } else {
            server.poll_url.replace("${hostname}", &server.ip)
        };
        let url_v6 = if server.ip6.is_empty() {
            String::new()
        } else {
            server.poll_url.replace("${hostname}", &format!("[{}]", server.ip6))
        };
        caches.probes.insert(
            server.host_name.clone(),
            Probe {
                target: ProbeTarget::Family { url, url_v6 },
                host: server.fqdn.clone(),
                timeout: Some(timeout),
                format: format.clone(),
                kind: ProbeKind::Http,
            },
        );
    }

    let mut peers = ProbeSet {
        interval: Duration::from_millis(snap.config.peer_polling_interval_ms),
        // peers are polled over whatever family their FQDN resolves to
        family: PollingFamily::Ipv4Only,
        ..ProbeSet::default()
    };
    for peer in &snap.traffic_monitors {
        if peer.host_name == self_name || !polled(&peer.status) {
            continue;
        }
        let port = peer.port.unwrap_or(80);
        let url = format!("http://{}:{}/publish/CrStates?raw", peer.fqdn, port);
        peers.probes.insert(
            peer.host_name.clone(),
            Probe {
                target: ProbeTarget::RoundRobin(vec![url]),
                host: String::new(),
                timeout: Some(timeout),
                format: format.clone(),
                kind: ProbeKind::Http,
            },
        );
    }

    (caches, peers)
}
