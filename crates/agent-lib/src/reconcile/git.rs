//! Git history for the config directory

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GitMode {
    Yes,
    #[default]
    Auto,
    No,
}

impl GitMode {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "yes" => GitMode::Yes,
            "no" => GitMode::No,
            _ => GitMode::Auto,
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self, GitMode::No)
    }
}

async fn git(dir: &Path, args: &[&str]) -> Result<(String, i32)> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .await
        .context("running git")?;
    Ok((
        format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
        output.status.code().unwrap_or(-1),
    ))
}

/// Initialize a repository in the config directory if one is missing.
pub async fn ensure_repo(dir: &Path) -> Result<()> {
    if dir.join(".git").is_dir() {
        debug!(dir = %dir.display(), "config dir is already a git repo");
        return Ok(());
    }
    let (out, rc) = git(dir, &["init"]).await?;
    if rc != 0 {
        bail!("git init in {}: {out}", dir.display());
    }
    info!(dir = %dir.display(), "initialized git repo for config dir");
    Ok(())
}

/// Commit everything in the config directory. `self_change` distinguishes
/// changes this agent wrote from changes found on disk that someone else
/// made since the last run.
pub async fn commit_all(dir: &Path, self_change: bool, success: bool) -> Result<()> {
    if !dir.join(".git").is_dir() {
        debug!(dir = %dir.display(), "not a git repo, skipping commit");
        return Ok(());
    }

    let (out, rc) = git(dir, &["add", "-A"]).await?;
    if rc != 0 {
        bail!("git add in {}: {out}", dir.display());
    }

    let message = match (self_change, success) {
        (true, true) => "cache-agent: applied config changes",
        (true, false) => "cache-agent: applied config changes (run failed)",
        (false, _) => "cache-agent: committing changes made outside the agent",
    };

    let (out, rc) = git(dir, &["commit", "-m", message]).await?;
    if rc != 0 && !out.contains("nothing to commit") {
        bail!("git commit in {}: {out}", dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_mode_parse() {
        assert_eq!(GitMode::parse("yes"), GitMode::Yes);
        assert_eq!(GitMode::parse("no"), GitMode::No);
        assert_eq!(GitMode::parse("auto"), GitMode::Auto);
        assert!(GitMode::Yes.enabled());
        assert!(!GitMode::No.enabled());
    }

    #[tokio::test]
    async fn test_commit_skips_outside_a_repo() {
        let dir = tempfile::tempdir().unwrap();
        // no .git directory: commit is a quiet no-op
        commit_all(dir.path(), true, true).await.unwrap();
    }
}
