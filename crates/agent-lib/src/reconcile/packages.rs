//! Package reconciliation
//!
//! The package database and the installer are reached through a trait so
//! tests substitute an in-memory fake; the real implementation shells out
//! to rpm and yum.

use crate::models::Package;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use tracing::{debug, error, info};

#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Installed packages whose name matches, as `name-version` strings.
    async fn installed(&self, name: &str) -> Result<Vec<String>>;
    /// Packages that depend on the given installed package.
    async fn requires(&self, name: &str) -> Result<Vec<String>>;
    /// Whether the repository can provide the package.
    async fn available(&self, pkg: &str) -> Result<bool>;
    async fn install(&self, pkg: &str) -> Result<()>;
    async fn remove(&self, pkg: &str) -> Result<()>;
}

/// rpm/yum backed implementation.
pub struct Rpm;

impl Rpm {
    async fn run(bin: &str, args: &[&str]) -> Result<(String, i32)> {
        let output = tokio::process::Command::new(bin)
            .args(args)
            .output()
            .await
            .with_context(|| format!("running {bin}"))?;
        Ok((
            String::from_utf8_lossy(&output.stdout).into_owned(),
            output.status.code().unwrap_or(-1),
        ))
    }
}

#[async_trait]
impl PackageManager for Rpm {
    async fn installed(&self, name: &str) -> Result<Vec<String>> {
        let (out, rc) = Self::run("/bin/rpm", &["-q", name]).await?;
        if rc != 0 {
            return Ok(Vec::new());
        }
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn requires(&self, name: &str) -> Result<Vec<String>> {
        let (out, rc) = Self::run("/bin/rpm", &["-q", "--whatrequires", name]).await?;
        if rc != 0 {
            return Ok(Vec::new());
        }
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn available(&self, pkg: &str) -> Result<bool> {
        let (_, rc) = Self::run("/usr/bin/yum", &["info", pkg]).await?;
        Ok(rc == 0)
    }

    async fn install(&self, pkg: &str) -> Result<()> {
        let (out, rc) = Self::run("/usr/bin/yum", &["install", "-y", pkg]).await?;
        if rc != 0 {
            bail!("yum install {pkg} failed: {out}");
        }
        Ok(())
    }

    async fn remove(&self, pkg: &str) -> Result<()> {
        let (out, rc) = Self::run("/usr/bin/yum", &["remove", "-y", pkg]).await?;
        if rc != 0 {
            bail!("yum remove {pkg} failed: {out}");
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackagePlan {
    pub install: Vec<String>,
    pub uninstall: Vec<String>,
    /// Already at the desired version; nothing to do.
    pub satisfied: Vec<String>,
}

/// Compare the desired package list against the local database. Differing
/// versions are scheduled as uninstall + install; packages that depend on
/// an outgoing version are scheduled for removal with it.
pub async fn plan_packages(
    mgr: &dyn PackageManager,
    desired: &[Package],
) -> Result<PackagePlan> {
    let mut plan = PackagePlan::default();

    for pkg in desired {
        info!(name = %pkg.name, version = %pkg.version, "processing package");
        let installed = mgr
            .installed(&pkg.name)
            .await
            .with_context(|| format!("querying package {}", pkg.name))?;
        let current = installed.first().cloned().unwrap_or_default();
        let full = pkg.full_name();

        if current == full {
            debug!(package = %full, "currently installed and not marked for removal");
            plan.satisfied.push(full);
        } else if !current.is_empty() {
            info!(package = %current, "currently installed and marked for removal");
            plan.uninstall.push(current.clone());
            info!(package = %full, "not installed and marked for installation");
            plan.install.push(full);
            for dependent in mgr.requires(&current).await? {
                info!(
                    package = %dependent,
                    depends_on = %current,
                    "installed dependent needs to be removed"
                );
                plan.uninstall.push(dependent);
            }
        } else {
            info!(package = %full, "not installed and marked for installation");
            plan.install.push(full);
        }
    }

    Ok(plan)
}

/// Execute a plan: verify availability, uninstall the outgoing packages,
/// then install the incoming ones. Returns the set actually installed.
pub async fn execute_plan(
    mgr: &dyn PackageManager,
    plan: &PackagePlan,
) -> Result<HashSet<String>> {
    for pkg in &plan.install {
        if !mgr.available(pkg).await? {
            bail!("package {pkg} is not available to install");
        }
    }
    if !plan.install.is_empty() {
        info!("all packages available, proceeding");
    }

    for pkg in &plan.uninstall {
        info!(package = %pkg, "uninstalling");
        mgr.remove(pkg).await.with_context(|| format!("unable to uninstall {pkg}"))?;
    }

    let mut installed = HashSet::new();
    for pkg in &plan.install {
        info!(package = %pkg, "installing");
        match mgr.install(pkg).await {
            Ok(()) => {
                installed.insert(pkg.clone());
            }
            Err(e) => {
                error!(package = %pkg, error = %e, "install failed");
                return Err(e).with_context(|| format!("unable to install {pkg}"));
            }
        }
    }

    Ok(installed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory package database for tests.
    #[derive(Default)]
    pub struct FakePkgs {
        pub db: Mutex<HashMap<String, String>>, // name -> name-version
        pub reverse_deps: Mutex<HashMap<String, Vec<String>>>,
        pub unavailable: Mutex<HashSet<String>>,
        pub installed_log: Mutex<Vec<String>>,
        pub removed_log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PackageManager for FakePkgs {
        async fn installed(&self, name: &str) -> Result<Vec<String>> {
            Ok(self.db.lock().unwrap().get(name).cloned().into_iter().collect())
        }

        async fn requires(&self, name: &str) -> Result<Vec<String>> {
            Ok(self.reverse_deps.lock().unwrap().get(name).cloned().unwrap_or_default())
        }

        async fn available(&self, pkg: &str) -> Result<bool> {
            Ok(!self.unavailable.lock().unwrap().contains(pkg))
        }

        async fn install(&self, pkg: &str) -> Result<()> {
            self.installed_log.lock().unwrap().push(pkg.to_string());
            Ok(())
        }

        async fn remove(&self, pkg: &str) -> Result<()> {
            self.removed_log.lock().unwrap().push(pkg.to_string());
            Ok(())
        }
    }

    fn desired(name: &str, version: &str) -> Package {
        Package { name: name.into(), version: version.into() }
    }

    #[tokio::test]
    async fn test_plan_satisfied_package_is_skipped() {
        let fake = FakePkgs::default();
        fake.db.lock().unwrap().insert("trafficserver".into(), "trafficserver-9.2.0".into());

        let plan = plan_packages(&fake, &[desired("trafficserver", "9.2.0")]).await.unwrap();
        assert!(plan.install.is_empty());
        assert!(plan.uninstall.is_empty());
        assert_eq!(plan.satisfied, vec!["trafficserver-9.2.0"]);
    }

    #[tokio::test]
    async fn test_plan_version_change_schedules_both() {
        let fake = FakePkgs::default();
        fake.db.lock().unwrap().insert("trafficserver".into(), "trafficserver-9.1.0".into());
        fake.reverse_deps
            .lock()
            .unwrap()
            .insert("trafficserver-9.1.0".into(), vec!["trafficserver-devel-9.1.0".into()]);

        let plan = plan_packages(&fake, &[desired("trafficserver", "9.2.0")]).await.unwrap();
        assert_eq!(plan.install, vec!["trafficserver-9.2.0"]);
        assert_eq!(plan.uninstall, vec!["trafficserver-9.1.0", "trafficserver-devel-9.1.0"]);
    }

    #[tokio::test]
    async fn test_plan_absent_package_is_installed() {
        let fake = FakePkgs::default();
        let plan = plan_packages(&fake, &[desired("ats-plugins", "1.0")]).await.unwrap();
        assert_eq!(plan.install, vec!["ats-plugins-1.0"]);
        assert!(plan.uninstall.is_empty());
    }

    #[tokio::test]
    async fn test_execute_uninstalls_before_installs() {
        let fake = FakePkgs::default();
        let plan = PackagePlan {
            install: vec!["trafficserver-9.2.0".into()],
            uninstall: vec!["trafficserver-9.1.0".into()],
            satisfied: vec![],
        };
        let installed = execute_plan(&fake, &plan).await.unwrap();
        assert!(installed.contains("trafficserver-9.2.0"));
        assert_eq!(*fake.removed_log.lock().unwrap(), vec!["trafficserver-9.1.0"]);
        assert_eq!(*fake.installed_log.lock().unwrap(), vec!["trafficserver-9.2.0"]);
    }

    #[tokio::test]
    async fn test_execute_fails_fast_when_unavailable() {
        let fake = FakePkgs::default();
        fake.unavailable.lock().unwrap().insert("ghost-1.0".into());
        let plan = PackagePlan {
            install: vec!["ghost-1.0".into()],
            uninstall: vec!["old-1.0".into()],
            satisfied: vec![],
        };
        assert!(execute_plan(&fake, &plan).await.is_err());
        // nothing was removed either
        assert!(fake.removed_log.lock().unwrap().is_empty());
    }
}
