//! Plugin reference verification for remap and plugin configs
//!
//! A plugin is valid iff its shared object exists in the plugin directory
//! or at the given absolute path. A plugin parameter naming a config file
//! is valid iff that file exists on disk or is among the files about to be
//! written this run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

const PARAM_FILE_SUFFIXES: &[&str] = &[".config", ".cfg", ".txt", ".yml", ".yaml"];

const REMAP_RULE_TYPES: &[&str] = &[
    "map",
    "map_with_recv_port",
    "map_with_referer",
    "reverse_map",
    "redirect",
    "redirect_temporary",
];

#[derive(Debug, Clone)]
pub struct RefsConfig {
    pub plugin_dir: PathBuf,
    pub config_dir: PathBuf,
}

/// Verifies plugin references, caching each verdict per run.
pub struct RefsChecker {
    cfg: RefsConfig,
    plugin_checks: HashMap<String, bool>,
    param_checks: HashMap<String, bool>,
}

impl RefsChecker {
    pub fn new(cfg: RefsConfig) -> Self {
        Self { cfg, plugin_checks: HashMap::new(), param_checks: HashMap::new() }
    }

    /// Check a whole config body. Returns the count of references that
    /// failed to verify; zero means the file is safe to install.
    pub fn check_config(&mut self, content: &str, files_adding: &HashSet<String>) -> usize {
        let mut errors = 0;
        let mut continued = Vec::new();
        let mut line_number = 1;

        for raw in content.lines() {
            if raw.starts_with('#') {
                continue;
            }
            continued.push(raw.to_string());
            if raw.ends_with('\\') {
                line_number += 1;
                continue;
            }
            let line = continued.join(" ").replace('\\', " ");
            continued.clear();
            errors += self.check_line(&line, line_number, files_adding);
            line_number += 1;
        }

        errors
    }

    fn check_line(&mut self, line: &str, line_number: usize, files_adding: &HashSet<String>) -> usize {
        let fields: Vec<&str> = line.split_whitespace().collect();
        debug!(line_number, ?fields, "checking config line");
        let mut errors = 0;

        if fields.len() > 3 && REMAP_RULE_TYPES.contains(&fields[0]) {
            for field in &fields[3..] {
                if let Some(plugin) = field.strip_prefix("@plugin=") {
                    let plugin = plugin.trim();
                    if !self.plugin_verified(plugin) {
                        error!(
                            plugin,
                            line_number,
                            "plugin is not available to the installed trafficserver"
                        );
                        errors += 1;
                    } else {
                        info!(plugin, line_number, "plugin DSO verified");
                    }
                } else if field.starts_with("@pparam") {
                    let parts: Vec<&str> = field.splitn(3, '=').collect();
                    if parts.len() < 2 {
                        error!(line_number, "malformed @pparam definition");
                        errors += 1;
                        continue;
                    }
                    let param = parts[1].trim();
                    if has_param_file_suffix(param)
                        && !self.param_file_verified(param, files_adding)
                    {
                        error!(param, line_number, "plugin config file does not exist");
                        errors += 1;
                    }
                }
            }
        } else if !fields.is_empty() && fields[0].ends_with(".so") {
            let plugin = fields[0].trim();
            if !self.plugin_verified(plugin) {
                error!(
                    plugin,
                    line_number,
                    "plugin is not available to the installed trafficserver"
                );
                errors += 1;
            }
            for field in &fields[1..] {
                let candidate = field.rsplit('=').next().unwrap_or(field).trim();
                if has_param_file_suffix(candidate)
                    && !self.param_file_verified(candidate, files_adding)
                {
                    error!(param = candidate, line_number, "plugin config file does not exist");
                    errors += 1;
                }
            }
        }

        errors
    }

    fn plugin_verified(&mut self, name: &str) -> bool {
        if let Some(&cached) = self.plugin_checks.get(name) {
            return cached;
        }
        let verified = verify_plugin(name, &self.cfg.plugin_dir);
        self.plugin_checks.insert(name.to_string(), verified);
        verified
    }

    fn param_file_verified(&mut self, name: &str, files_adding: &HashSet<String>) -> bool {
        if let Some(&cached) = self.param_checks.get(name) {
            return cached;
        }
        let verified = verify_param_file(name, &self.cfg.config_dir, files_adding);
        self.param_checks.insert(name.to_string(), verified);
        verified
    }
}

fn has_param_file_suffix(name: &str) -> bool {
    PARAM_FILE_SUFFIXES.iter().any(|s| name.ends_with(s))
}

fn file_exists(path: &Path) -> bool {
    path.is_file()
}

fn verify_plugin(name: &str, plugin_dir: &Path) -> bool {
    if !name.ends_with(".so") {
        return false;
    }
    let path = Path::new(name);
    if path.is_absolute() {
        file_exists(path)
    } else {
        file_exists(&plugin_dir.join(name))
    }
}

fn verify_param_file(name: &str, config_dir: &Path, files_adding: &HashSet<String>) -> bool {
    // the name may carry a path; files-adding entries are bare names
    let base = Path::new(name)
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    if files_adding.contains(&base) {
        return true;
    }
    let path = Path::new(name);
    if path.is_absolute() {
        file_exists(path)
    } else {
        file_exists(&config_dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(dir: &Path) -> RefsChecker {
        RefsChecker::new(RefsConfig {
            plugin_dir: dir.join("plugins"),
            config_dir: dir.join("config"),
        })
    }

    fn setup(dir: &Path) {
        std::fs::create_dir_all(dir.join("plugins")).unwrap();
        std::fs::create_dir_all(dir.join("config")).unwrap();
        std::fs::write(dir.join("plugins/regex_revalidate.so"), b"").unwrap();
        std::fs::write(dir.join("config/regex_revalidate.config"), b"").unwrap();
    }

    #[test]
    fn test_remap_line_with_valid_refs() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let mut c = checker(dir.path());

        let line = "map http://a/ http://o/ ext @plugin=regex_revalidate.so @pparam=--config @pparam=regex_revalidate.config";
        assert_eq!(c.check_config(line, &HashSet::new()), 0);
    }

    #[test]
    fn test_remap_line_with_missing_plugin() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let mut c = checker(dir.path());

        let line = "map http://a/ http://o/ ext @plugin=nope.so";
        assert_eq!(c.check_config(line, &HashSet::new()), 1);
    }

    #[test]
    fn test_param_file_satisfied_by_files_adding() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let mut c = checker(dir.path());

        let adding: HashSet<String> = ["url_sig_cdl.config".to_string()].into();
        let line = "map http://a/ http://o/ x @plugin=regex_revalidate.so @pparam=url_sig_cdl.config";
        assert_eq!(c.check_config(line, &adding), 0);
        // and fails without the pending write
        let mut c2 = checker(dir.path());
        assert_eq!(c2.check_config(line, &HashSet::new()), 1);
    }

    #[test]
    fn test_plugin_config_lines() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let mut c = checker(dir.path());

        let content = "\
# a comment
regex_revalidate.so --config=regex_revalidate.config
missing.so
";
        assert_eq!(c.check_config(content, &HashSet::new()), 1);
    }

    #[test]
    fn test_line_continuations_are_joined() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let mut c = checker(dir.path());

        let content = "map http://a/ http://o/ ext \\\n  @plugin=regex_revalidate.so\n";
        assert_eq!(c.check_config(content, &HashSet::new()), 0);
    }

    #[test]
    fn test_absolute_plugin_path() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let so = dir.path().join("plugins/regex_revalidate.so");
        let mut c = checker(dir.path());

        let line = format!("map http://a/ http://o/ ext @plugin={}", so.display());
        assert_eq!(c.check_config(&line, &HashSet::new()), 0);
    }

    #[test]
    fn test_non_config_pparam_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        setup(dir.path());
        let mut c = checker(dir.path());

        let line = "map http://a/ http://o/ ext @plugin=regex_revalidate.so @pparam=--static-prefix=cdn";
        assert_eq!(c.check_config(line, &HashSet::new()), 0);
    }
}
