//! Parent-availability control
//!
//! Keeps the local cache's parent table synchronized with reality: parents
//! are discovered from `parent.config` and `strategies.yaml`, their current
//! state is read from the cache's host-status subsystem, and a monitor's
//! combined view decides, with hysteresis, when to mark a parent up or down.

mod ctl;
mod files;
mod supervisor;

pub use ctl::{parse_host_status, read_host_status, ControlPort, CtlForm, TrafficCtl};
pub use files::{add_strategy_hosts, parse_parent_config, read_strategies, Strategies};
pub use supervisor::{
    spawn_sighup_listener, ConfigSource, MonitorClient, ParentHealthConfig, ParentSupervisor,
    StaticConfigSource,
};

use serde::Serialize;

/// Which host-status reason bit this client manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasonCode {
    Active,
    Local,
    #[default]
    Manual,
}

impl ReasonCode {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "active" => ReasonCode::Active,
            "local" => ReasonCode::Local,
            _ => ReasonCode::Manual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Active => "active",
            ReasonCode::Local => "local",
            ReasonCode::Manual => "manual",
        }
    }
}

/// Host-status record for one parent. A parent is available only when all
/// three reason bits are up.
#[derive(Debug, Clone, Serialize)]
pub struct ParentStatus {
    pub fqdn: String,
    pub active_reason: bool,
    pub local_reason: bool,
    pub manual_reason: bool,
    pub last_tm_poll: i64,
    pub unavailable_poll_count: u32,
    pub mark_up_poll_count: u32,
}

impl ParentStatus {
    /// A freshly discovered parent defaults to available until host status
    /// has been read at least once.
    pub fn discovered(fqdn: impl Into<String>) -> Self {
        Self {
            fqdn: fqdn.into().trim().to_string(),
            active_reason: true,
            local_reason: true,
            manual_reason: true,
            last_tm_poll: 0,
            unavailable_poll_count: 0,
            mark_up_poll_count: 0,
        }
    }

    /// The reason bit selected by the configured reason code.
    pub fn available(&self, reason: ReasonCode) -> bool {
        match reason {
            ReasonCode::Active => self.active_reason,
            ReasonCode::Local => self.local_reason,
            ReasonCode::Manual => self.manual_reason,
        }
    }

    pub fn status(&self) -> &'static str {
        if self.active_reason && self.local_reason && self.manual_reason {
            "UP"
        } else {
            "DOWN"
        }
    }
}

/// Host key for a parent: the first DNS label, or the whole string when it
/// is an IP address.
pub fn host_from_fqdn(fqdn: &str) -> String {
    if fqdn.parse::<std::net::IpAddr>().is_ok() {
        return fqdn.to_string();
    }
    fqdn.split('.').next().unwrap_or(fqdn).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_from_fqdn() {
        assert_eq!(host_from_fqdn("cdn-cache-01.example.com"), "cdn-cache-01");
        assert_eq!(host_from_fqdn("192.0.2.7"), "192.0.2.7");
        assert_eq!(host_from_fqdn("2001:db8::1"), "2001:db8::1");
        assert_eq!(host_from_fqdn("bare"), "bare");
    }

    #[test]
    fn test_availability_is_conjunction() {
        let mut p = ParentStatus::discovered("cdn-cache-01.example.com");
        assert_eq!(p.status(), "UP");
        p.manual_reason = false;
        assert_eq!(p.status(), "DOWN");
        assert!(p.available(ReasonCode::Active));
        assert!(!p.available(ReasonCode::Manual));
    }

    #[test]
    fn test_reason_code_parse() {
        assert_eq!(ReasonCode::parse("ACTIVE"), ReasonCode::Active);
        assert_eq!(ReasonCode::parse("local"), ReasonCode::Local);
        assert_eq!(ReasonCode::parse("bogus"), ReasonCode::Manual);
    }
}
