//! Directory-watch ingest
//!
//! Each supported type gets a drop directory; a file created there is
//! dispatched and then renamed with a sentinel suffix recording the
//! outcome. Empty files are retried a bounded number of times, since the
//! writer may not have finished when the create event fires.

use super::{Dispatcher, Outcome};
use anyhow::{Context, Result};
use dashmap::DashMap;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const PROCESSED: &str = ".processed";
const REJECTED: &str = ".rejected";
const RETRY: &str = ".retry";

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Base directory holding one subdirectory per type.
    pub base_dir: PathBuf,
    /// Grace period between the create event and the read, so the writer
    /// can finish.
    pub settle_delay: Duration,
    /// Empty observations tolerated per original file name.
    pub max_empty_tries: u32,
}

impl WatchConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            settle_delay: Duration::from_millis(100),
            max_empty_tries: 10,
        }
    }
}

pub struct DirWatcher {
    dispatcher: Arc<Dispatcher>,
    cfg: WatchConfig,
    empty_counts: DashMap<String, u32>,
}

/// Keeps the notify watcher and its bridge task alive.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    _task: tokio::task::JoinHandle<()>,
}

impl DirWatcher {
    pub fn new(dispatcher: Arc<Dispatcher>, cfg: WatchConfig) -> Self {
        Self { dispatcher, cfg, empty_counts: DashMap::new() }
    }

    /// Create the per-type directories and start watching them. Events are
    /// bridged from notify's callback thread onto a task that processes
    /// them serially, which also serializes handling per file.
    pub fn start(self: Arc<Self>) -> Result<WatcherHandle> {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .context("creating filesystem watcher")?;

        for ty in self.dispatcher.types() {
            let dir = self.cfg.base_dir.join(ty);
            if !dir.is_dir() {
                use std::os::unix::fs::PermissionsExt;
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("creating watch dir {}", dir.display()))?;
                std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
            }
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("watching {}", dir.display()))?;
            info!(dir = %dir.display(), "watching");
        }

        let this = self.clone();
        let rt = tokio::runtime::Handle::current();
        let task = tokio::task::spawn_blocking(move || {
            for event in rx {
                let arrived = matches!(
                    event.kind,
                    EventKind::Create(_)
                        | EventKind::Modify(ModifyKind::Name(RenameMode::To))
                        | EventKind::Modify(ModifyKind::Name(RenameMode::Any))
                );
                if !arrived {
                    continue;
                }
                for path in &event.paths {
                    rt.block_on(this.process_path(path));
                }
            }
            debug!("watcher channel closed");
        });

        Ok(WatcherHandle { _watcher: watcher, _task: task })
    }

    /// Process files that were already sitting in the drop directories
    /// before the watcher started, walking the types in dependency order
    /// so references resolve on the first pass where possible.
    pub async fn sweep_existing(&self) {
        for ty in self.dispatcher.types() {
            let dir = self.cfg.base_dir.join(ty);
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            paths.sort();
            for path in paths {
                self.process_path(&path).await;
            }
        }
    }

    /// Handle one observed file. Factored out of the event loop so the
    /// lifecycle is testable without a real watcher.
    pub async fn process_path(&self, path: &Path) {
        let name = path.to_string_lossy().to_string();
        if name.ends_with(PROCESSED) || name.ends_with(REJECTED) {
            return;
        }
        let Ok(meta) = std::fs::metadata(path) else {
            debug!(path = %name, "skipping, cannot stat");
            return;
        };
        if meta.is_dir() {
            return;
        }
        info!(path = %name, "new file");

        // let the writer finish before reading
        tokio::time::sleep(self.cfg.settle_delay).await;

        let ty = path
            .parent()
            .and_then(Path::file_name)
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut suffix = REJECTED;
        if self.dispatcher.supported(&ty) {
            info!(r#type = %ty, path = %name, "creating");
            match std::fs::read(path) {
                Ok(body) => match self.dispatcher.dispatch(&ty, &body).await {
                    Ok(Outcome::Empty) => {
                        let original = strip_retry_suffixes(&name);
                        let mut count =
                            self.empty_counts.entry(original.clone()).or_insert(0);
                        *count += 1;
                        info!(
                            path = %original,
                            tried = *count,
                            max = self.cfg.max_empty_tries,
                            "empty json object"
                        );
                        if *count < self.cfg.max_empty_tries {
                            let retry_name = format!("{name}{RETRY}");
                            if let Err(e) = std::fs::rename(path, &retry_name) {
                                warn!(error = %e, from = %name, to = %retry_name, "renaming for retry");
                            }
                            return;
                        }
                    }
                    Ok(_) => suffix = PROCESSED,
                    Err(e) => {
                        warn!(r#type = %ty, path = %name, error = %e, "error creating");
                    }
                },
                Err(e) => warn!(path = %name, error = %e, "reading file"),
            }
        } else {
            info!(r#type = %ty, "no method for creating");
        }

        let final_name = format!("{name}{suffix}");
        if let Err(e) = std::fs::rename(path, &final_name) {
            warn!(error = %e, from = %name, to = %final_name, "renaming");
        }
    }
}

/// The original file name with any accumulated `.retry` suffixes removed.
fn strip_retry_suffixes(name: &str) -> String {
    let mut out = name;
    while let Some(stripped) = out.strip_suffix(RETRY) {
        out = stripped;
    }
    out.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{OpsClient, OpsConfig};
    use httpmock::{Method::POST, MockServer};

    fn watcher_for(server: &MockServer, base: &Path, max_empty: u32) -> DirWatcher {
        let ops = OpsClient::new(OpsConfig {
            url: server.base_url(),
            user: "admin".into(),
            password: "pw".into(),
            api_version: "4.0".into(),
            timeout_secs: 5,
            initial_backoff_secs: 1,
            max_backoff_secs: 2,
        })
        .unwrap();
        let mut cfg = WatchConfig::new(base);
        cfg.settle_delay = Duration::from_millis(1);
        cfg.max_empty_tries = max_empty;
        DirWatcher::new(Arc::new(Dispatcher::new(ops)), cfg)
    }

    #[test]
    fn test_strip_retry_suffixes() {
        assert_eq!(strip_retry_suffixes("host.json"), "host.json");
        assert_eq!(strip_retry_suffixes("host.json.retry"), "host.json");
        assert_eq!(strip_retry_suffixes("host.json.retry.retry"), "host.json");
    }

    #[tokio::test]
    async fn test_successful_document_is_marked_processed() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/api/4.0/cdns");
            then.status(200).json_body(serde_json::json!({"alerts": []}));
        });

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cdns")).unwrap();
        let file = dir.path().join("cdns/cdn-a.json");
        std::fs::write(&file, br#"{"name": "cdn-a"}"#).unwrap();

        let w = watcher_for(&server, dir.path(), 10);
        w.process_path(&file).await;

        assert!(!file.exists());
        assert!(dir.path().join("cdns/cdn-a.json.processed").exists());
    }

    #[tokio::test]
    async fn test_undecodable_document_is_rejected() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cdns")).unwrap();
        let file = dir.path().join("cdns/broken.json");
        std::fs::write(&file, b"{ not json").unwrap();

        let w = watcher_for(&server, dir.path(), 10);
        w.process_path(&file).await;

        assert!(dir.path().join("cdns/broken.json.rejected").exists());
    }

    #[tokio::test]
    async fn test_unknown_type_directory_is_rejected() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("widgets")).unwrap();
        let file = dir.path().join("widgets/w.json");
        std::fs::write(&file, br#"{"a": 1}"#).unwrap();

        let w = watcher_for(&server, dir.path(), 10);
        w.process_path(&file).await;

        assert!(dir.path().join("widgets/w.json.rejected").exists());
    }

    #[tokio::test]
    async fn test_empty_document_retry_lifecycle() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("servers")).unwrap();
        let original = dir.path().join("servers/host.json");
        std::fs::write(&original, b"{}").unwrap();

        let w = watcher_for(&server, dir.path(), 3);

        // first two observations rename with accumulating .retry suffixes
        w.process_path(&original).await;
        let retry1 = dir.path().join("servers/host.json.retry");
        assert!(retry1.exists());

        w.process_path(&retry1).await;
        let retry2 = dir.path().join("servers/host.json.retry.retry");
        assert!(retry2.exists());

        // the third observation exhausts the budget
        w.process_path(&retry2).await;
        assert!(dir.path().join("servers/host.json.retry.retry.rejected").exists());
        assert!(!retry2.exists());
    }

    #[tokio::test]
    async fn test_sweep_existing_handles_preloaded_files() {
        let server = MockServer::start_async().await;
        let cdns = server.mock(|when, then| {
            when.method(POST).path("/api/4.0/cdns");
            then.status(200).json_body(serde_json::json!({"alerts": []}));
        });
        let types = server.mock(|when, then| {
            when.method(POST).path("/api/4.0/types");
            then.status(200).json_body(serde_json::json!({"alerts": []}));
        });

        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cdns")).unwrap();
        std::fs::create_dir_all(dir.path().join("types")).unwrap();
        std::fs::write(dir.path().join("cdns/cdn-a.json"), br#"{"name": "cdn-a"}"#).unwrap();
        std::fs::write(dir.path().join("types/edge.json"), br#"{"name": "EDGE"}"#).unwrap();
        // already-handled files are left alone
        std::fs::write(dir.path().join("cdns/old.json.processed"), b"{}").unwrap();

        let w = watcher_for(&server, dir.path(), 10);
        w.sweep_existing().await;

        cdns.assert();
        types.assert();
        assert!(dir.path().join("cdns/cdn-a.json.processed").exists());
        assert!(dir.path().join("types/edge.json.processed").exists());
        assert!(dir.path().join("cdns/old.json.processed").exists());
    }

    #[tokio::test]
    async fn test_already_processed_files_are_ignored() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("cdns")).unwrap();
        let file = dir.path().join("cdns/done.json.processed");
        std::fs::write(&file, br#"{"name": "x"}"#).unwrap();

        let w = watcher_for(&server, dir.path(), 10);
        w.process_path(&file).await;

        // untouched
        assert!(file.exists());
    }
}
