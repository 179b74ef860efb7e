//! The cache control CLI
//!
//! Host status is read with the v10 form (`traffic_ctl host status`) and
//! falls back to the v9 form (`traffic_ctl metric match host_status`) when
//! that fails; the working form is remembered for subsequent polls.

use super::{host_from_fqdn, ParentStatus, ReasonCode};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};

const TRAFFIC_CTL: &str = "traffic_ctl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CtlForm {
    #[default]
    V10,
    V9,
}

/// Seam over the control CLI so tests can substitute a fake.
#[async_trait]
pub trait ControlPort: Send + Sync {
    /// Raw line-oriented host status output in the given form.
    async fn host_status(&self, form: CtlForm) -> Result<String>;
    /// Mark a host up or down with the given reason.
    async fn mark_host(&self, fqdn: &str, up: bool, reason: ReasonCode) -> Result<()>;
}

/// The real CLI, invoked from the trafficserver bin directory.
pub struct TrafficCtl {
    bin_dir: PathBuf,
}

impl TrafficCtl {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self { bin_dir: bin_dir.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let bin = self.bin_dir.join(TRAFFIC_CTL);
        let output = tokio::process::Command::new(&bin)
            .args(args)
            .output()
            .await
            .with_context(|| format!("running {}", bin.display()))?;
        if !output.status.success() {
            bail!(
                "{TRAFFIC_CTL} {}: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ControlPort for TrafficCtl {
    async fn host_status(&self, form: CtlForm) -> Result<String> {
        match form {
            CtlForm::V10 => self.run(&["host", "status"]).await,
            CtlForm::V9 => self.run(&["metric", "match", "host_status"]).await,
        }
    }

    async fn mark_host(&self, fqdn: &str, up: bool, reason: ReasonCode) -> Result<()> {
        let status = if up { "up" } else { "down" };
        self.run(&["host", status, "--reason", reason.as_str(), fqdn])
            .await
            .with_context(|| format!("marking {fqdn} {status}"))?;
        Ok(())
    }
}

/// Read host status, auto-downgrading from the v10 form to the v9 form.
/// Returns the output together with the form that worked, which the caller
/// caches for the rest of its lifetime.
pub async fn read_host_status(ctl: &dyn ControlPort, form: CtlForm) -> Result<(String, CtlForm)> {
    match ctl.host_status(form).await {
        Ok(out) => Ok((out, form)),
        Err(e) if form == CtlForm::V10 => {
            info!(
                error = %e,
                "{TRAFFIC_CTL} v10 host status form failed, downgrading to the v9 form"
            );
            let out = ctl.host_status(CtlForm::V9).await?;
            Ok((out, CtlForm::V9))
        }
        Err(e) => Err(e),
    }
}

/// Parse host-status output into the parents table.
///
/// A host already in the table keeps its poll bookkeeping; its reason bits
/// are replaced only when the availability selected by `reason` changed.
pub fn parse_host_status(
    output: &str,
    parents: &mut HashMap<String, ParentStatus>,
    reason: ReasonCode,
) {
    for line in output.lines() {
        let fields: Vec<&str> = line.trim().split(' ').collect();
        if fields.len() != 2 {
            continue;
        }

        // v9 prefixes the fqdn with an internal stat name; v10 does not
        let fqdn = fields[0]
            .strip_prefix("proxy.process.host_status.")
            .unwrap_or(fields[0]);

        let stat_fields: Vec<&str> = fields[1].split(',').collect();
        if stat_fields.len() != 5 {
            continue;
        }

        let bit = |field: &str, prefix: &str| -> Option<bool> {
            if field.starts_with(&format!("{prefix}:UP")) {
                Some(true)
            } else if field.starts_with(&format!("{prefix}:DOWN")) {
                Some(false)
            } else {
                None
            }
        };

        let parsed = ParentStatus {
            fqdn: fqdn.to_string(),
            active_reason: bit(stat_fields[1], "ACTIVE").unwrap_or(true),
            local_reason: bit(stat_fields[2], "LOCAL").unwrap_or(true),
            manual_reason: bit(stat_fields[3], "MANUAL").unwrap_or(true),
            last_tm_poll: 0,
            unavailable_poll_count: 0,
            mark_up_poll_count: 0,
        };

        let host = host_from_fqdn(fqdn);
        match parents.get(&host) {
            None => {
                info!(host = %host, "adding host from host status to the parents table");
                parents.insert(host, parsed);
            }
            Some(existing) => {
                if existing.available(reason) != parsed.available(reason) {
                    info!(host = %host, status = parsed.status(), "host status changed");
                    let mut updated = parsed;
                    updated.last_tm_poll = existing.last_tm_poll;
                    updated.unavailable_poll_count = existing.unavailable_poll_count;
                    updated.mark_up_poll_count = existing.mark_up_poll_count;
                    parents.insert(host, updated);
                } else {
                    debug!(host = %host, "host status unchanged");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const V9_OUTPUT: &str = "\
proxy.process.host_status.cdn-cache-01.example HOST_STATUS_DOWN,ACTIVE:UP:0:0,LOCAL:UP:0:0,MANUAL:DOWN:1556896844:0,SELF_DETECT:UP:0
proxy.process.host_status.cdn-cache-02.example HOST_STATUS_UP,ACTIVE:UP:0:0,LOCAL:UP:0:0,MANUAL:UP:0:0,SELF_DETECT:UP:0
";

    #[test]
    fn test_parse_v9_host_status() {
        let mut parents = HashMap::new();
        parse_host_status(V9_OUTPUT, &mut parents, ReasonCode::Manual);

        let one = &parents["cdn-cache-01"];
        assert_eq!(one.fqdn, "cdn-cache-01.example");
        assert!(one.active_reason);
        assert!(one.local_reason);
        assert!(!one.manual_reason);
        assert_eq!(one.status(), "DOWN");

        let two = &parents["cdn-cache-02"];
        assert!(two.active_reason && two.local_reason && two.manual_reason);
        assert_eq!(two.status(), "UP");
    }

    #[test]
    fn test_parse_v10_unprefixed_lines() {
        let mut parents = HashMap::new();
        parse_host_status(
            "mid-01.example HOST_STATUS_UP,ACTIVE:UP:0:0,LOCAL:UP:0:0,MANUAL:UP:0:0,SELF_DETECT:UP:0\n",
            &mut parents,
            ReasonCode::Manual,
        );
        assert_eq!(parents["mid-01"].fqdn, "mid-01.example");
    }

    #[test]
    fn test_parse_preserves_counters_when_unchanged() {
        let mut parents = HashMap::new();
        let mut seeded = ParentStatus::discovered("cdn-cache-02.example");
        seeded.unavailable_poll_count = 3;
        seeded.last_tm_poll = 42;
        parents.insert("cdn-cache-02".to_string(), seeded);

        parse_host_status(V9_OUTPUT, &mut parents, ReasonCode::Manual);
        let p = &parents["cdn-cache-02"];
        assert_eq!(p.unavailable_poll_count, 3);
        assert_eq!(p.last_tm_poll, 42);
    }

    #[test]
    fn test_parse_carries_counters_across_a_change() {
        let mut parents = HashMap::new();
        let mut seeded = ParentStatus::discovered("cdn-cache-01.example");
        seeded.mark_up_poll_count = 2;
        parents.insert("cdn-cache-01".to_string(), seeded);

        parse_host_status(V9_OUTPUT, &mut parents, ReasonCode::Manual);
        let p = &parents["cdn-cache-01"];
        assert!(!p.manual_reason);
        assert_eq!(p.mark_up_poll_count, 2);
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let mut parents = HashMap::new();
        parse_host_status("garbage\nalso garbage with spaces everywhere\n", &mut parents, ReasonCode::Manual);
        assert!(parents.is_empty());
    }

    struct FlakyCtl {
        calls: Mutex<Vec<CtlForm>>,
    }

    #[async_trait]
    impl ControlPort for FlakyCtl {
        async fn host_status(&self, form: CtlForm) -> Result<String> {
            self.calls.lock().unwrap().push(form);
            match form {
                CtlForm::V10 => bail!("unrecognized command"),
                CtlForm::V9 => Ok(V9_OUTPUT.to_string()),
            }
        }

        async fn mark_host(&self, _: &str, _: bool, _: ReasonCode) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_auto_downgrade_remembers_v9() {
        let ctl = FlakyCtl { calls: Mutex::new(Vec::new()) };
        let (out, form) = read_host_status(&ctl, CtlForm::V10).await.unwrap();
        assert_eq!(form, CtlForm::V9);
        assert!(out.contains("cdn-cache-01"));

        // subsequent reads go straight to the working form
        let (_, form) = read_host_status(&ctl, form).await.unwrap();
        assert_eq!(form, CtlForm::V9);
        let calls = ctl.calls.lock().unwrap();
        assert_eq!(*calls, vec![CtlForm::V10, CtlForm::V9, CtlForm::V9]);
    }
}
