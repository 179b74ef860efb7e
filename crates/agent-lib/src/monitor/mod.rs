//! Monitor-side state: config polling, probe-set derivation, and the
//! combiner that merges local observations with peer-monitor opinions
//! into the authoritative per-cache availability view.

mod combiner;
mod config;

pub use combiner::{CacheAvailability, Combiner, CombinerHandle, PeerOpinion};
pub use config::{derive_probe_sets, ConfigPoller, ConfigPollerHandle};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// An availability transition observed by the combiner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub time: chrono::DateTime<chrono::Utc>,
    pub name: String,
    pub hostname: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "isAvailable")]
    pub available: bool,
    pub description: String,
}

/// Bounded in-memory log of the most recent events.
#[derive(Debug, Default)]
pub struct EventLog {
    events: VecDeque<Event>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self { events: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn add(&mut self, event: Event) {
        if self.capacity > 0 && self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Most recent first.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.iter().rev().cloned().collect()
    }
}
