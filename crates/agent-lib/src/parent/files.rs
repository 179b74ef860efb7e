//! Parent discovery from the cache's own config files

use super::ParentStatus;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// The pieces of `strategies.yaml` that name parents.
#[derive(Debug, Default, Deserialize)]
pub struct Strategies {
    #[serde(default)]
    pub strategies: Vec<Strategy>,
    #[serde(default)]
    pub hosts: Vec<StrategyHost>,
    #[serde(default)]
    pub groups: serde_yaml::Value,
}

#[derive(Debug, Deserialize)]
pub struct Strategy {
    pub strategy: String,
    #[serde(default)]
    pub policy: String,
    #[serde(default)]
    pub go_direct: bool,
}

#[derive(Debug, Deserialize)]
pub struct StrategyHost {
    pub host: String,
    #[serde(default)]
    pub protocol: Vec<StrategyProtocol>,
}

#[derive(Debug, Deserialize)]
pub struct StrategyProtocol {
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub weight: f64,
}

/// Union the parents named in a `parent.config` body into the table.
/// Entries already present are never removed or replaced.
pub fn parse_parent_config(content: &str, parents: &mut HashMap<String, ParentStatus>) {
    for line in content.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        // the parent list is the quoted value of a mid-line parent= field
        let Some(idx) = line.find("parent=") else { continue };
        if idx == 0 {
            continue;
        }
        let Some(quoted) = line.split('"').nth(1) else { continue };

        let mut list: Vec<&str> = quoted.trim().split(';').collect();
        if list.len() == 1 {
            list = quoted.trim().split(',').collect();
        }
        if list.len() <= 1 {
            continue;
        }

        for entry in list {
            let pair: Vec<&str> = entry.split(':').collect();
            if pair.len() != 2 {
                continue;
            }
            let fqdn = pair[0];
            let host = super::host_from_fqdn(fqdn);
            if !parents.contains_key(&host) {
                debug!(host = %host, "adding host from parent.config to the parents table");
                parents.insert(host, ParentStatus::discovered(fqdn));
            }
        }
    }
}

/// Read `strategies.yaml`, splicing in any `#include` files relative to the
/// config directory, and parse the combined stream.
pub fn read_strategies(path: &Path, config_dir: &Path) -> Result<Strategies> {
    let main = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let mut includes = Vec::new();
    for line in main.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("#include") {
            let name = rest.trim();
            if !name.is_empty() {
                includes.push(config_dir.join(name));
            }
        }
    }

    let mut combined = String::new();
    for include in &includes {
        debug!(file = %include.display(), "loading strategies include");
        let content = std::fs::read_to_string(include)
            .with_context(|| format!("reading include {}", include.display()))?;
        combined.push_str(&content);
    }
    combined.push_str(&main);

    serde_yaml::from_str(&combined)
        .with_context(|| format!("unmarshalling {}", path.display()))
}

/// Union the hosts named by a strategies document into the table.
pub fn add_strategy_hosts(strategies: &Strategies, parents: &mut HashMap<String, ParentStatus>) {
    for host in &strategies.hosts {
        let key = super::host_from_fqdn(&host.host);
        if !parents.contains_key(&key) {
            info!(host = %key, "adding host from strategies.yaml to the parents table");
            parents.insert(key, ParentStatus::discovered(host.host.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parent_config_semicolon_list() {
        let content = r#"
# comment line
dest_domain=origin.example port=443 parent="mid-01.example:8080;mid-02.example:8080;" round_robin=consistent_hash
"#;
        let mut parents = HashMap::new();
        parse_parent_config(content, &mut parents);
        assert_eq!(parents.len(), 2);
        assert_eq!(parents["mid-01"].fqdn, "mid-01.example");
        assert!(parents["mid-02"].available(super::super::ReasonCode::Manual));
    }

    #[test]
    fn test_parse_parent_config_comma_list() {
        let content = r#"dest_domain=. parent="mid-01.example:80,mid-03.example:80" go_direct=false"#;
        let mut parents = HashMap::new();
        parse_parent_config(content, &mut parents);
        assert!(parents.contains_key("mid-01"));
        assert!(parents.contains_key("mid-03"));
    }

    #[test]
    fn test_parse_parent_config_keeps_existing_entries() {
        let content = r#"dest_domain=. parent="mid-01.example:80;mid-02.example:80;""#;
        let mut parents = HashMap::new();
        let mut existing = ParentStatus::discovered("mid-01.example");
        existing.manual_reason = false;
        existing.unavailable_poll_count = 4;
        parents.insert("mid-01".to_string(), existing);

        parse_parent_config(content, &mut parents);
        assert!(!parents["mid-01"].manual_reason);
        assert_eq!(parents["mid-01"].unavailable_poll_count, 4);
    }

    #[test]
    fn test_strategies_with_include() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("hosts.yaml"),
            "hosts:\n  - host: mid-01.example\n    protocol:\n      - scheme: http\n        port: 8080\n",
        )
        .unwrap();
        let main = dir.path().join("strategies.yaml");
        std::fs::write(
            &main,
            "#include hosts.yaml\nstrategies:\n  - strategy: mid-tier\n    policy: consistent_hash\n",
        )
        .unwrap();

        let strategies = read_strategies(&main, dir.path()).unwrap();
        assert_eq!(strategies.hosts.len(), 1);
        assert_eq!(strategies.strategies.len(), 1);

        let mut parents = HashMap::new();
        add_strategy_hosts(&strategies, &mut parents);
        assert_eq!(parents["mid-01"].fqdn, "mid-01.example");
    }

    #[test]
    fn test_strategies_missing_include_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("strategies.yaml");
        std::fs::write(&main, "#include nope.yaml\n").unwrap();
        assert!(read_strategies(&main, dir.path()).is_err());
    }
}
