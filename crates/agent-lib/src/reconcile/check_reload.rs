//! Transition classification
//!
//! Given the files an invocation actually changed, decide whether the
//! cache needs nothing, a config reload, or a full restart. The same logic
//! backs the check-reload subtool, whose stdin/stdout sentinel form is a
//! versioned external interface.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Wire input of the check-reload subtool.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChangedPaths {
    /// Comma-separated list of changed file paths.
    #[serde(rename = "changed_files")]
    pub changed_files: String,
    /// Comma-separated list of packages installed this run.
    #[serde(rename = "installed_packages", default)]
    pub installed_packages: String,
}

impl ChangedPaths {
    pub fn files(&self) -> Vec<String> {
        split_list(&self.changed_files)
    }

    pub fn packages(&self) -> Vec<String> {
        split_list(&self.installed_packages)
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceNeeds {
    Nothing,
    Reload,
    Restart,
}

impl ServiceNeeds {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceNeeds::Nothing => "nothing",
            ServiceNeeds::Reload => "needs-reload",
            ServiceNeeds::Restart => "needs-restart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "nothing" => Some(ServiceNeeds::Nothing),
            "needs-reload" => Some(ServiceNeeds::Reload),
            "needs-restart" => Some(ServiceNeeds::Restart),
            _ => None,
        }
    }
}

const RESTART_FILES: &[&str] = &["plugin.config", "50-ats.rules"];

const RELOAD_PREFIXES: &[&str] =
    &["bg_fetch", "hdr_rw_", "regex_remap_", "set_dscp_", "url_sig_", "uri_signing"];

const RELOAD_FILES: &[&str] = &["records.config", "ssl_multicert.config", "remap.config"];

fn file_name(path: &str) -> &str {
    Path::new(path).file_name().and_then(|f| f.to_str()).unwrap_or(path)
}

fn dir_of(path: &str) -> &str {
    Path::new(path).parent().and_then(|d| d.to_str()).unwrap_or("")
}

fn requires_restart(path: &str) -> bool {
    let name = file_name(path);
    RESTART_FILES.iter().any(|f| name == *f)
}

fn requires_reload(path: &str) -> bool {
    let name = file_name(path);
    if RELOAD_FILES.iter().any(|f| name == *f) {
        return true;
    }
    if RELOAD_PREFIXES.iter().any(|p| name.starts_with(p)) || name.ends_with(".lua") {
        return true;
    }
    if path.contains("/trafficserver/") {
        return true;
    }
    let dir = dir_of(path);
    if dir.ends_with("ssl") && (name.ends_with(".cer") || name.ends_with(".key")) {
        return true;
    }
    false
}

/// The transition required by a set of changed files, the max over all of
/// them. A trafficserver package installed this run always forces a
/// restart.
pub fn classify(changed_files: &[String], installed_packages: &[String]) -> ServiceNeeds {
    if installed_packages.iter().any(|p| p.starts_with("trafficserver")) {
        return ServiceNeeds::Restart;
    }
    let mut needs = ServiceNeeds::Nothing;
    for path in changed_files {
        if requires_restart(path) {
            return ServiceNeeds::Restart;
        }
        if requires_reload(path) {
            needs = needs.max(ServiceNeeds::Reload);
        }
    }
    needs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plugin_config_requires_restart() {
        let needs = classify(&paths(&["/opt/trafficserver/etc/trafficserver/plugin.config"]), &[]);
        assert_eq!(needs, ServiceNeeds::Restart);
    }

    #[test]
    fn test_udev_rules_require_restart() {
        assert_eq!(classify(&paths(&["/etc/udev/rules.d/50-ats.rules"]), &[]), ServiceNeeds::Restart);
    }

    #[test]
    fn test_new_trafficserver_package_requires_restart() {
        let needs = classify(&[], &["trafficserver-9.2.0".to_string()]);
        assert_eq!(needs, ServiceNeeds::Restart);
    }

    #[test]
    fn test_records_config_requires_reload() {
        let needs = classify(&paths(&["/opt/trafficserver/etc/records.config"]), &[]);
        assert_eq!(needs, ServiceNeeds::Reload);
    }

    #[test]
    fn test_remap_adjacent_prefixes_require_reload() {
        for name in
            ["hdr_rw_ds.config", "url_sig_x.config", "uri_signing_a.config", "set_dscp_12.config", "bg_fetch.config", "regex_remap_ds.config", "policy.lua"]
        {
            let needs = classify(&paths(&[&format!("/etc/other/{name}")]), &[]);
            assert_eq!(needs, ServiceNeeds::Reload, "{name}");
        }
    }

    #[test]
    fn test_ssl_material_requires_reload() {
        assert_eq!(
            classify(&paths(&["/opt/trafficserver/etc/ssl/cdn.example.cer"]), &[]),
            ServiceNeeds::Reload
        );
        assert_eq!(
            classify(&paths(&["/opt/trafficserver/etc/ssl/cdn.example.key"]), &[]),
            ServiceNeeds::Reload
        );
    }

    #[test]
    fn test_config_tree_requires_reload() {
        assert_eq!(
            classify(&paths(&["/opt/trafficserver/etc/trafficserver/parent.config"]), &[]),
            ServiceNeeds::Reload
        );
    }

    #[test]
    fn test_unrelated_file_needs_nothing() {
        assert_eq!(classify(&paths(&["/etc/cron.d/ats-cleanup"]), &[]), ServiceNeeds::Nothing);
        assert_eq!(classify(&[], &[]), ServiceNeeds::Nothing);
    }

    #[test]
    fn test_max_wins_across_files() {
        let needs = classify(
            &paths(&[
                "/etc/cron.d/ats-cleanup",
                "/opt/trafficserver/etc/records.config",
                "/opt/trafficserver/etc/trafficserver/plugin.config",
            ]),
            &[],
        );
        assert_eq!(needs, ServiceNeeds::Restart);
    }

    #[test]
    fn test_wire_shape_round_trip() {
        let input: ChangedPaths = serde_json::from_str(
            r#"{"changed_files": "a.config, b.lua", "installed_packages": "trafficserver-9.2"}"#,
        )
        .unwrap();
        assert_eq!(input.files(), vec!["a.config", "b.lua"]);
        assert_eq!(input.packages(), vec!["trafficserver-9.2"]);
        assert_eq!(ServiceNeeds::parse("needs-reload"), Some(ServiceNeeds::Reload));
        assert_eq!(ServiceNeeds::parse(ServiceNeeds::Restart.as_str()), Some(ServiceNeeds::Restart));
    }
}
