//! Periodic HTTP probe engine
//!
//! Maintains a set of probes keyed by a stable ID. A reconfigure computes a
//! minimal diff against the running set: only changed or removed probes are
//! torn down, only new or changed probes are started. Each probe runs as its
//! own task and delivers results to a typed channel; the consumer signals
//! completion per result, which keeps at most one poll outstanding per probe
//! and preserves tick order per probe ID.

mod engine;
mod http;

pub use engine::{PollingEngine, ProbeSpawn};
pub use http::HttpProber;

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

/// Which IP families a probe may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollingFamily {
    #[default]
    Ipv4Only,
    Ipv6Only,
    /// Alternate between v4 and v6 on successive ticks.
    Both,
}

impl PollingFamily {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "ipv6only" | "ipv6" => PollingFamily::Ipv6Only,
            "both" => PollingFamily::Both,
            _ => PollingFamily::Ipv4Only,
        }
    }
}

/// What a probe does on each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeKind {
    #[default]
    Http,
    /// Produces an empty successful result without any request. Used to
    /// keep a probe slot ticking when its target should not be contacted.
    Noop,
}

/// Where a probe sends its requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// A v4/v6 URL pair; the polling family picks which one a tick uses.
    /// Either may be empty when that family is not served.
    Family { url: String, url_v6: String },
    /// A fixed URL list stepped round-robin from a random start.
    RoundRobin(Vec<String>),
}

/// A single probe definition. Probes are equal iff every field is equal;
/// inequality for the same ID forces a stop/start replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub target: ProbeTarget,
    /// Explicit Host header. Empty means derive from the URL.
    pub host: String,
    /// Per-probe timeout override; None uses the prober default.
    pub timeout: Option<Duration>,
    /// Accept header value.
    pub format: String,
    pub kind: ProbeKind,
}

/// The full desired probe set. The global fields apply to every probe;
/// changing either tears down and rebuilds the entire set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeSet {
    pub probes: HashMap<String, Probe>,
    pub interval: Duration,
    pub no_keep_alive: bool,
    pub family: PollingFamily,
}

/// One poll outcome, delivered to the engine's result channel.
///
/// The consumer must send on `finished` when it is done handling the
/// result; the probe's tick loop blocks on it before the next tick.
#[derive(Debug)]
pub struct ProbeResult {
    pub id: String,
    pub kind: ProbeKind,
    pub poll_id: u64,
    pub body: Option<Vec<u8>>,
    pub error: Option<String>,
    pub req_end: chrono::DateTime<chrono::Utc>,
    pub req_time: Duration,
    pub used_ipv6: bool,
    pub finished: oneshot::Sender<u64>,
}

/// Compute the minimal transition from `old` to `new`: IDs to kill, and
/// probes to start. A global interval or keep-alive change restarts
/// everything.
pub fn diff_probe_sets(old: &ProbeSet, new: &ProbeSet) -> (Vec<String>, Vec<ProbeSpawn>) {
    let mut deletions = Vec::new();
    let mut additions = Vec::new();

    let spawn = |id: &str, probe: &Probe| ProbeSpawn {
        id: id.to_string(),
        probe: probe.clone(),
        interval: new.interval,
        no_keep_alive: new.no_keep_alive,
        family: new.family,
    };

    if old.interval != new.interval || old.no_keep_alive != new.no_keep_alive {
        deletions.extend(old.probes.keys().cloned());
        additions.extend(new.probes.iter().map(|(id, p)| spawn(id, p)));
        return (deletions, additions);
    }

    for (id, old_probe) in &old.probes {
        match new.probes.get(id) {
            None => deletions.push(id.clone()),
            Some(new_probe) if new_probe != old_probe => {
                deletions.push(id.clone());
                additions.push(spawn(id, new_probe));
            }
            Some(_) => {}
        }
    }

    for (id, new_probe) in &new.probes {
        if !old.probes.contains_key(id) {
            additions.push(spawn(id, new_probe));
        }
    }

    (deletions, additions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_probe(url: &str) -> Probe {
        Probe {
            target: ProbeTarget::Family { url: url.to_string(), url_v6: String::new() },
            host: "cache.example".to_string(),
            timeout: None,
            format: "application/json".to_string(),
            kind: ProbeKind::Http,
        }
    }

    fn set(probes: &[(&str, Probe)], interval_ms: u64, no_keep_alive: bool) -> ProbeSet {
        ProbeSet {
            probes: probes.iter().map(|(id, p)| (id.to_string(), p.clone())).collect(),
            interval: Duration::from_millis(interval_ms),
            no_keep_alive,
            family: PollingFamily::Ipv4Only,
        }
    }

    #[test]
    fn test_diff_unchanged_probe_is_undisturbed() {
        let old = set(&[("a", http_probe("http://a/_stats"))], 10_000, false);
        let new = set(
            &[("a", http_probe("http://a/_stats")), ("b", http_probe("http://b/_stats"))],
            10_000,
            false,
        );

        let (deletions, additions) = diff_probe_sets(&old, &new);
        assert!(deletions.is_empty());
        assert_eq!(additions.len(), 1);
        assert_eq!(additions[0].id, "b");
    }

    #[test]
    fn test_diff_changed_probe_is_replaced() {
        let old = set(&[("a", http_probe("http://a/_stats"))], 10_000, false);
        let new = set(&[("a", http_probe("http://a/_astats"))], 10_000, false);

        let (deletions, additions) = diff_probe_sets(&old, &new);
        assert_eq!(deletions, vec!["a".to_string()]);
        assert_eq!(additions.len(), 1);
        assert_eq!(additions[0].id, "a");
    }

    #[test]
    fn test_diff_removed_probe_is_deleted() {
        let old = set(
            &[("a", http_probe("http://a/_stats")), ("b", http_probe("http://b/_stats"))],
            10_000,
            false,
        );
        let new = set(&[("a", http_probe("http://a/_stats"))], 10_000, false);

        let (deletions, additions) = diff_probe_sets(&old, &new);
        assert_eq!(deletions, vec!["b".to_string()]);
        assert!(additions.is_empty());
    }

    #[test]
    fn test_diff_interval_change_rebuilds_everything() {
        let old = set(
            &[("a", http_probe("http://a/_stats")), ("b", http_probe("http://b/_stats"))],
            10_000,
            false,
        );
        let new = set(
            &[("a", http_probe("http://a/_stats")), ("c", http_probe("http://c/_stats"))],
            5_000,
            false,
        );

        let (mut deletions, additions) = diff_probe_sets(&old, &new);
        deletions.sort();
        assert_eq!(deletions, vec!["a".to_string(), "b".to_string()]);
        let mut added: Vec<&str> = additions.iter().map(|a| a.id.as_str()).collect();
        added.sort();
        assert_eq!(added, vec!["a", "c"]);
    }

    #[test]
    fn test_diff_keep_alive_change_rebuilds_everything() {
        let old = set(&[("a", http_probe("http://a/_stats"))], 10_000, false);
        let new = set(&[("a", http_probe("http://a/_stats"))], 10_000, true);

        let (deletions, additions) = diff_probe_sets(&old, &new);
        assert_eq!(deletions, vec!["a".to_string()]);
        assert_eq!(additions.len(), 1);
    }

    #[test]
    fn test_polling_family_parse() {
        assert_eq!(PollingFamily::parse("both"), PollingFamily::Both);
        assert_eq!(PollingFamily::parse("ipv6only"), PollingFamily::Ipv6Only);
        assert_eq!(PollingFamily::parse("anything"), PollingFamily::Ipv4Only);
    }
}
