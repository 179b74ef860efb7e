//! Filesystem helpers shared by the agent and the health client
//!
//! Config files are always replaced via a temp file in the same directory
//! followed by a rename, so a crash mid-write can never leave a partial
//! file at the destination path.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const TEMP_SUFFIX: &str = ".tmp";

/// Ownership and mode applied to a file or directory on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOwnership {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl FileOwnership {
    pub fn root(mode: u32) -> Self {
        Self { uid: 0, gid: 0, mode }
    }
}

/// Write `contents` to `path` atomically: write `<path>.tmp` with the target
/// mode and owner, then rename over the destination.
pub fn atomic_write(path: &Path, contents: &[u8], own: FileOwnership) -> Result<()> {
    let tmp_path = {
        let mut s = path.as_os_str().to_owned();
        s.push(TEMP_SUFFIX);
        std::path::PathBuf::from(s)
    };

    let mut f = fs::File::create(&tmp_path)
        .with_context(|| format!("creating temp file {}", tmp_path.display()))?;
    f.write_all(contents)
        .with_context(|| format!("writing temp file {}", tmp_path.display()))?;
    f.flush()?;

    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(own.mode))
        .with_context(|| format!("setting mode on {}", tmp_path.display()))?;
    set_owner(&tmp_path, own.uid, own.gid)?;

    fs::rename(&tmp_path, path).with_context(|| {
        format!("renaming {} to {}", tmp_path.display(), path.display())
    })?;
    Ok(())
}

/// Chown wrapper that tolerates running unprivileged: a permission error is
/// reported to the caller only when the process is actually root.
pub fn set_owner(path: &Path, uid: u32, gid: u32) -> Result<()> {
    match std::os::unix::fs::chown(path, Some(uid), Some(gid)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && !is_root() => {
            tracing::debug!(path = %path.display(), uid, gid, "not root, skipping chown");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("chown {}", path.display())),
    }
}

pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Create `dir` (and parents) if missing and apply the given ownership.
pub fn mkdir_with_owner(dir: &Path, own: FileOwnership) -> Result<()> {
    if !dir.is_dir() {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating directory {}", dir.display()))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(own.mode))?;
    }
    set_owner(dir, own.uid, own.gid)
}

/// Modification time of `path` in nanoseconds since the epoch.
pub fn file_mod_time(path: &Path) -> Result<i64> {
    let meta = fs::metadata(path)
        .with_context(|| format!("reading metadata for {}", path.display()))?;
    let modified = meta
        .modified()
        .with_context(|| format!("reading mtime for {}", path.display()))?;
    let dur = modified
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(dur.as_nanos() as i64)
}

/// Create `path` if absent, otherwise bump its mtime.
pub fn touch(path: &Path) -> Result<()> {
    let f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("touching {}", path.display()))?;
    f.set_modified(std::time::SystemTime::now())
        .with_context(|| format!("updating mtime of {}", path.display()))?;
    Ok(())
}

/// A config file on disk whose mtime is tracked across polls.
#[derive(Debug, Clone)]
pub struct TrackedFile {
    pub path: std::path::PathBuf,
    pub last_modify: i64,
}

impl TrackedFile {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        let path = path.into();
        let last_modify = file_mod_time(&path)?;
        Ok(Self { path, last_modify })
    }

    /// Whether the on-disk mtime has advanced past the recorded one.
    /// Does not update the recorded time; call `mark_read` once the
    /// new contents have actually been consumed.
    pub fn changed(&self) -> Result<bool> {
        Ok(file_mod_time(&self.path)? > self.last_modify)
    }

    pub fn mark_read(&mut self) -> Result<()> {
        self.last_modify = file_mod_time(&self.path)?;
        Ok(())
    }
}
