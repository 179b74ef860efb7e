//! State combiner
//!
//! A single task owns the combined availability view. It consumes local
//! cache probe results on one channel and peer CrStates results on another,
//! and applies the optimistic-quorum rule: peers can hold a cache up that
//! the local probe still sees, and only unanimous agreement takes it down.

use super::Event;
use crate::models::CrStates;
use crate::observability::Metrics;
use crate::poller::ProbeResult;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Local observation record for one cache.
#[derive(Debug, Clone, Default)]
pub struct CacheAvailability {
    pub available: bool,
    pub status: String,
    pub last_poll: Option<chrono::DateTime<chrono::Utc>>,
    pub consecutive_unavailable: u32,
    pub consecutive_available: u32,
}

/// One peer monitor's latest opinion of every cache, with its receipt time.
/// Opinions older than the staleness horizon are excluded from quorum.
#[derive(Debug, Clone)]
pub struct PeerOpinion {
    pub states: HashMap<String, bool>,
    pub time: chrono::DateTime<chrono::Utc>,
}

/// Read-side handle to the combiner.
#[derive(Clone)]
pub struct CombinerHandle {
    pub combined_rx: watch::Receiver<CrStates>,
    /// Retargets the staleness horizon when the peer polling interval
    /// changes.
    pub staleness_tx: mpsc::Sender<Duration>,
}

pub struct Combiner {
    quorum_min: usize,
    staleness: Duration,
    staleness_rx: mpsc::Receiver<Duration>,
    local: HashMap<String, CacheAvailability>,
    peers: HashMap<String, PeerOpinion>,
    combined: CrStates,
    publish: watch::Sender<CrStates>,
    events: mpsc::Sender<Event>,
    metrics: Metrics,
}

impl Combiner {
    pub fn new(
        quorum_min: usize,
        staleness: Duration,
        events: mpsc::Sender<Event>,
    ) -> (Self, CombinerHandle) {
        let (publish, combined_rx) = watch::channel(CrStates::default());
        let (staleness_tx, staleness_rx) = mpsc::channel(1);
        (
            Self {
                quorum_min,
                staleness,
                staleness_rx,
                local: HashMap::new(),
                peers: HashMap::new(),
                combined: CrStates::default(),
                publish,
                events,
                metrics: Metrics::new(),
            },
            CombinerHandle { combined_rx, staleness_tx },
        )
    }

    /// The staleness horizon tracks the peer polling interval.
    pub fn set_staleness(&mut self, staleness: Duration) {
        self.staleness = staleness;
    }

    /// Consume cache and peer probe results until both channels close.
    pub async fn run(
        mut self,
        mut cache_rx: mpsc::Receiver<ProbeResult>,
        mut peer_rx: mpsc::Receiver<ProbeResult>,
    ) {
        loop {
            tokio::select! {
                result = cache_rx.recv() => {
                    match result {
                        Some(r) => self.handle_cache_result(r).await,
                        None => return,
                    }
                }
                result = peer_rx.recv() => {
                    match result {
                        Some(r) => self.handle_peer_result(r).await,
                        None => return,
                    }
                }
                Some(staleness) = self.staleness_rx.recv() => {
                    self.staleness = staleness;
                }
            }
        }
    }

    async fn handle_cache_result(&mut self, result: ProbeResult) {
        let available = result.error.is_none();
        self.metrics.observe_poll("cache", available, result.req_time.as_secs_f64());
        let status = match &result.error {
            Some(e) => e.clone(),
            None => "available".to_string(),
        };

        let entry = self.local.entry(result.id.clone()).or_default();
        entry.last_poll = Some(result.req_end);
        entry.status = status;
        if available {
            entry.consecutive_available += 1;
            entry.consecutive_unavailable = 0;
        } else {
            entry.consecutive_unavailable += 1;
            entry.consecutive_available = 0;
        }
        entry.available = available;

        self.recompute(&result.id).await;
        let _ = result.finished.send(result.poll_id);
    }

    async fn handle_peer_result(&mut self, result: ProbeResult) {
        self.metrics
            .observe_poll("peer", result.error.is_none(), result.req_time.as_secs_f64());
        match (&result.body, &result.error) {
            (Some(body), None) => match serde_json::from_slice::<CrStates>(body) {
                Ok(states) => {
                    let opinion = PeerOpinion {
                        states: states
                            .caches
                            .into_iter()
                            .map(|(cache, s)| (cache, s.is_available))
                            .collect(),
                        time: result.req_end,
                    };
                    let touched: Vec<String> = opinion.states.keys().cloned().collect();
                    self.peers.insert(result.id.clone(), opinion);
                    for cache in touched {
                        self.recompute(&cache).await;
                    }
                }
                Err(e) => warn!(peer = %result.id, error = %e, "undecodable peer CrStates"),
            },
            _ => {
                debug!(peer = %result.id, error = ?result.error, "peer poll failed");
            }
        }
        let _ = result.finished.send(result.poll_id);
    }

    /// Non-stale peer opinions about `cache`.
    fn fresh_peer_opinions(&self, cache: &str) -> Vec<bool> {
        let horizon = chrono::Duration::from_std(self.staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = chrono::Utc::now();
        self.peers
            .values()
            .filter(|op| now.signed_duration_since(op.time) <= horizon)
            .filter_map(|op| op.states.get(cache).copied())
            .collect()
    }

    async fn recompute(&mut self, cache: &str) {
        let Some(local) = self.local.get(cache) else {
            // a cache only peers know about: wait for a local observation
            return;
        };
        let peers = self.fresh_peer_opinions(cache);
        let previous = self.combined.caches.get(cache).map(|s| s.is_available);

        let available_peers = peers.iter().filter(|a| **a).count();
        let next = if local.available && available_peers >= self.quorum_min {
            true
        } else if !local.available && peers.iter().all(|a| !a) {
            false
        } else {
            // disagreement: retain the previous combined value to avoid
            // flapping on a single peer's opinion
            match previous {
                Some(prev) => prev,
                None => local.available,
            }
        };

        if previous == Some(next) {
            return;
        }

        let status = if next { "available" } else { &local.status };
        self.combined.set(cache, next, status.to_string());
        self.publish.send_replace(self.combined.clone());

        // the transition is applied downstream: restart the streak counters
        if let Some(entry) = self.local.get_mut(cache) {
            entry.consecutive_available = 0;
            entry.consecutive_unavailable = 0;
        }

        let event = Event {
            time: chrono::Utc::now(),
            name: cache.to_string(),
            hostname: cache.to_string(),
            event_type: "CACHE".to_string(),
            available: next,
            description: self
                .local
                .get(cache)
                .map(|e| e.status.clone())
                .unwrap_or_default(),
        };
        debug!(cache, available = next, "combined availability transition");
        if self.events.send(event).await.is_err() {
            warn!("event channel closed");
        }
    }
}
