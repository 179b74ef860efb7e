//! Probe task lifecycle

use super::{
    diff_probe_sets, HttpProber, PollingFamily, Probe, ProbeResult, ProbeSet, ProbeTarget,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Everything a probe task needs to start.
#[derive(Debug, Clone)]
pub struct ProbeSpawn {
    pub id: String,
    pub probe: Probe,
    pub interval: Duration,
    pub no_keep_alive: bool,
    pub family: PollingFamily,
}

/// Owns the running probe tasks and their cancellation channels.
///
/// The engine is single-owner: reconfiguration and shutdown go through
/// `&mut self`, so probe lifecycles are serialized by construction.
pub struct PollingEngine {
    prober: Arc<HttpProber>,
    results: mpsc::Sender<ProbeResult>,
    config: ProbeSet,
    kills: HashMap<String, oneshot::Sender<()>>,
    poll_counter: Arc<AtomicU64>,
}

impl PollingEngine {
    pub fn new(prober: Arc<HttpProber>, results: mpsc::Sender<ProbeResult>) -> Self {
        Self {
            prober,
            results,
            config: ProbeSet::default(),
            kills: HashMap::new(),
            poll_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the running set with `new`, disturbing only probes that
    /// changed. A global interval or keep-alive change restarts everything.
    pub fn reconfigure(&mut self, new: ProbeSet) {
        let (deletions, additions) = diff_probe_sets(&self.config, &new);
        debug!(
            deletions = deletions.len(),
            additions = additions.len(),
            total = new.probes.len(),
            "reconfiguring probe set"
        );

        for id in deletions {
            if let Some(kill) = self.kills.remove(&id) {
                // the task may already be gone if the result channel closed
                let _ = kill.send(());
            }
        }

        for info in additions {
            self.spawn(info);
        }

        self.config = new;
    }

    /// Terminate every probe.
    pub fn stop(&mut self) {
        for (_, kill) in self.kills.drain() {
            let _ = kill.send(());
        }
        self.config = ProbeSet::default();
    }

    /// IDs currently running.
    pub fn running(&self) -> Vec<String> {
        self.kills.keys().cloned().collect()
    }

    fn spawn(&mut self, info: ProbeSpawn) {
        let (kill_tx, kill_rx) = oneshot::channel();
        if self.kills.insert(info.id.clone(), kill_tx).is_some() {
            warn!(id = %info.id, "replacing a probe that was still registered");
        }
        tokio::spawn(probe_loop(
            info,
            self.prober.clone(),
            self.results.clone(),
            self.poll_counter.clone(),
            kill_rx,
        ));
    }
}

impl Drop for PollingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe_loop(
    info: ProbeSpawn,
    prober: Arc<HttpProber>,
    results: mpsc::Sender<ProbeResult>,
    poll_counter: Arc<AtomicU64>,
    mut kill: oneshot::Receiver<()>,
) {
    // spread probe start times over one interval so a reconfigure doesn't
    // hit every target at the same instant
    let jitter = Duration::from_nanos(
        rand::thread_rng().gen_range(0..info.interval.as_nanos().max(1) as u64),
    );
    tokio::select! {
        _ = tokio::time::sleep(jitter) => {}
        _ = &mut kill => return,
    }

    let mut tick = tokio::time::interval_at(
        tokio::time::Instant::now() + info.interval,
        info.interval,
    );
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let oscillate = info.family == PollingFamily::Both;
    let mut using_ipv4 = info.family != PollingFamily::Ipv6Only;
    let mut round_robin_index = match &info.probe.target {
        ProbeTarget::RoundRobin(urls) if !urls.is_empty() => {
            rand::thread_rng().gen_range(0..urls.len())
        }
        _ => 0,
    };

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let url = match &info.probe.target {
                    ProbeTarget::Family { url, url_v6 } => {
                        // skip the tick and toggle when the current family
                        // has no URL to poll
                        if (using_ipv4 && url.is_empty()) || (!using_ipv4 && url_v6.is_empty()) {
                            using_ipv4 = !using_ipv4;
                            continue;
                        }
                        if using_ipv4 { url.clone() } else { url_v6.clone() }
                    }
                    ProbeTarget::RoundRobin(urls) => {
                        if urls.is_empty() {
                            continue;
                        }
                        let url = urls[round_robin_index].clone();
                        round_robin_index = (round_robin_index + 1) % urls.len();
                        url
                    }
                };

                let poll_id = poll_counter.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(id = %info.id, poll_id, %url, "poll start");

                let outcome = prober
                    .probe(
                        info.probe.kind,
                        &url,
                        &info.probe.host,
                        info.probe.timeout,
                        info.no_keep_alive,
                        &info.probe.format,
                    )
                    .await;

                let (finished_tx, finished_rx) = oneshot::channel();
                let result = ProbeResult {
                    id: info.id.clone(),
                    kind: info.probe.kind,
                    poll_id,
                    body: outcome.body,
                    error: outcome.error,
                    req_end: outcome.req_end,
                    req_time: outcome.req_time,
                    used_ipv6: !using_ipv4,
                    finished: finished_tx,
                };

                if results.send(result).await.is_err() {
                    debug!(id = %info.id, "result channel closed, probe exiting");
                    return;
                }

                if oscillate {
                    using_ipv4 = !using_ipv4;
                }

                // at most one outstanding poll per probe: wait for the
                // consumer to finish with this result before the next tick
                let _ = finished_rx.await;
            }
            _ = &mut kill => {
                debug!(id = %info.id, "probe cancelled");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::ProbeKind;
    use httpmock::{Method::GET, MockServer};

    fn probe_for(url: String) -> Probe {
        Probe {
            target: ProbeTarget::Family { url, url_v6: String::new() },
            host: String::new(),
            timeout: None,
            format: "application/json".into(),
            kind: ProbeKind::Http,
        }
    }

    fn set_of(probes: Vec<(&str, Probe)>, interval: Duration) -> ProbeSet {
        ProbeSet {
            probes: probes.into_iter().map(|(id, p)| (id.to_string(), p)).collect(),
            interval,
            no_keep_alive: false,
            family: PollingFamily::Ipv4Only,
        }
    }

    /// Drains results, acking each one, for roughly `dur`.
    async fn collect_for(
        rx: &mut mpsc::Receiver<ProbeResult>,
        dur: Duration,
    ) -> Vec<(String, u64)> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            let timeout = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(result)) => {
                    let _ = result.finished.send(result.poll_id);
                    seen.push((result.id, result.poll_id));
                }
                _ => return seen,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_engine_polls_and_preserves_per_probe_order() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/a");
            then.status(200).body("a");
        });
        server.mock(|when, then| {
            when.method(GET).path("/b");
            then.status(200).body("b");
        });

        let (tx, mut rx) = mpsc::channel(16);
        let prober = Arc::new(HttpProber::new("test", Duration::from_secs(1)).unwrap());
        let mut engine = PollingEngine::new(prober, tx);

        engine.reconfigure(set_of(
            vec![("a", probe_for(server.url("/a"))), ("b", probe_for(server.url("/b")))],
            Duration::from_millis(30),
        ));

        let seen = collect_for(&mut rx, Duration::from_millis(400)).await;
        engine.stop();

        let a_polls: Vec<u64> =
            seen.iter().filter(|(id, _)| id == "a").map(|(_, n)| *n).collect();
        let b_polls: Vec<u64> =
            seen.iter().filter(|(id, _)| id == "b").map(|(_, n)| *n).collect();
        assert!(a_polls.len() >= 2, "expected repeated polls for a, got {a_polls:?}");
        assert!(b_polls.len() >= 2, "expected repeated polls for b, got {b_polls:?}");
        // per-probe receive order matches tick order
        assert!(a_polls.windows(2).all(|w| w[0] < w[1]), "a out of order: {a_polls:?}");
        assert!(b_polls.windows(2).all(|w| w[0] < w[1]), "b out of order: {b_polls:?}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reconfigure_converges_to_new_set() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path_contains("/");
            then.status(200).body("ok");
        });

        let (tx, mut rx) = mpsc::channel(16);
        let prober = Arc::new(HttpProber::new("test", Duration::from_secs(1)).unwrap());
        let mut engine = PollingEngine::new(prober, tx);

        engine.reconfigure(set_of(
            vec![("a", probe_for(server.url("/a"))), ("b", probe_for(server.url("/b")))],
            Duration::from_millis(25),
        ));
        let mut running = engine.running();
        running.sort();
        assert_eq!(running, vec!["a", "b"]);

        // drop b, keep a, add c
        engine.reconfigure(set_of(
            vec![("a", probe_for(server.url("/a"))), ("c", probe_for(server.url("/c")))],
            Duration::from_millis(25),
        ));
        let mut running = engine.running();
        running.sort();
        assert_eq!(running, vec!["a", "c"]);

        // b stops delivering once its kill lands; a and c keep going
        let _ = collect_for(&mut rx, Duration::from_millis(150)).await;
        let late = collect_for(&mut rx, Duration::from_millis(150)).await;
        assert!(late.iter().all(|(id, _)| id != "b"), "b still polling: {late:?}");
        assert!(late.iter().any(|(id, _)| id == "a"));
        assert!(late.iter().any(|(id, _)| id == "c"));

        engine.stop();
        assert!(engine.running().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_probe_keeps_ticking() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/down");
            then.status(500);
        });

        let (tx, mut rx) = mpsc::channel(16);
        let prober = Arc::new(HttpProber::new("test", Duration::from_secs(1)).unwrap());
        let mut engine = PollingEngine::new(prober, tx);
        engine.reconfigure(set_of(
            vec![("down", probe_for(server.url("/down")))],
            Duration::from_millis(25),
        ));

        let mut failures = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(400);
        while tokio::time::Instant::now() < deadline && failures < 3 {
            if let Ok(Some(result)) =
                tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
            {
                assert!(result.error.is_some());
                let _ = result.finished.send(result.poll_id);
                failures += 1;
            }
        }
        engine.stop();
        assert!(failures >= 3, "probe stopped after failure");
    }
}
