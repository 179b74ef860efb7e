//! File-specific audits run before a config file may be written

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing::{error, info, warn};

/// Rewrite remap override markers into their canonical form.
///
/// A `##OVERRIDE##` rule wins over an earlier plain rule with the same
/// "from" URL. The winning rules are emitted first, each preceded by a bare
/// `##OVERRIDE##` comment, and every losing rule is rewritten with the
/// `##OVERRIDDEN##` prefix so the history stays visible in the file.
/// Returns the body unchanged when no markers are present.
pub fn process_remap_overrides(body: &str) -> Result<String> {
    if body.is_empty() {
        bail!("the remap config is empty, nothing to process");
    }

    let mut overridden_froms: HashMap<&str, usize> = HashMap::new();
    let mut winners: Vec<String> = Vec::new();
    let mut override_count = 0usize;
    let mut overridden_count = 0usize;

    for line in body.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 3 && fields[0] == "##OVERRIDE##" {
            overridden_froms.insert(fields[2], 1);
            winners.push("##OVERRIDE##".to_string());
            winners.push(line.trim_start().trim_start_matches("##OVERRIDE## ").to_string());
            override_count += 1;
        }
    }

    if override_count == 0 {
        return Ok(body.to_string());
    }

    let mut newlines = winners;
    for line in body.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if line.is_empty() || fields.len() < 2 {
            continue;
        }
        if fields[0] == "##OVERRIDE##" {
            continue;
        }
        if overridden_froms.contains_key(fields[1]) {
            newlines.push(format!("##OVERRIDDEN## {line}"));
            overridden_count += 1;
        } else {
            newlines.push(line.to_string());
        }
    }

    info!(
        overridden = overridden_count,
        overrides = override_count,
        "rewrote remap override rules"
    );

    let mut out = newlines.join("\n");
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// Validate a certificate body. Returns warnings rather than failing the
/// file: a bad certificate should surface in the summary, not stop the run.
pub fn check_cert(body: &[u8]) -> Vec<String> {
    let pem = match x509_parser::pem::parse_x509_pem(body) {
        Ok((_, pem)) => pem,
        Err(e) => return vec![format!("certificate is not valid PEM: {e}")],
    };
    let cert = match pem.parse_x509() {
        Ok(cert) => cert,
        Err(e) => return vec![format!("certificate is not valid X.509: {e}")],
    };

    let mut warnings = Vec::new();
    let not_after = cert.validity().not_after;
    if !cert.validity().is_valid() {
        warnings.push(format!("certificate is not currently valid, expires {not_after}"));
    }
    warnings
}

/// Audit disk-device ownership declared by udev rules.
///
/// For every `KERNEL==` rule with a non-root owner, the matching `/dev`
/// node must exist and be owned by that user's uid. Mismatches are logged
/// and returned as warnings; the file itself is still written.
pub fn process_udev_rules(body: &str, dev_root: &Path) -> Vec<String> {
    let mut warnings = Vec::new();

    for line in body.lines() {
        if !line.starts_with("KERNEL==") {
            continue;
        }
        let vals: Vec<&str> = line.split('"').collect();
        if vals.len() < 4 {
            continue;
        }
        let device = vals[1];
        let owner = vals[3];
        if owner == "root" {
            continue;
        }

        let Some(expected_uid) = uid_of_user(owner) else {
            error!(owner, "no such user on this system");
            warnings.push(format!("udev rule names unknown user '{owner}'"));
            continue;
        };

        let dev_path = dev_root.join(device);
        let Ok(meta) = std::fs::metadata(&dev_path) else {
            continue;
        };
        info!(device = %dev_path.display(), "found device in udev rules");
        let uid = meta.uid();
        if uid != expected_uid {
            let msg = format!(
                "device {} is owned by uid {uid}, not {owner} ({expected_uid})",
                dev_path.display()
            );
            error!("{msg}");
            warnings.push(msg);
        } else {
            info!(device = %dev_path.display(), "device ownership is okay");
        }
    }

    warnings
}

/// Uid of a named system user, if one exists.
pub fn uid_of_user(name: &str) -> Option<u32> {
    let c_name = std::ffi::CString::new(name).ok()?;
    // SAFETY: getpwnam returns a pointer into static storage or null; we
    // only read the uid field while the pointer is live in this call.
    unsafe {
        let pw = libc::getpwnam(c_name.as_ptr());
        if pw.is_null() {
            None
        } else {
            Some((*pw).pw_uid)
        }
    }
}

/// Uid and gid of a named system user.
pub fn ids_of_user(name: &str) -> Option<(u32, u32)> {
    let c_name = std::ffi::CString::new(name).ok()?;
    // SAFETY: as in uid_of_user.
    unsafe {
        let pw = libc::getpwnam(c_name.as_ptr());
        if pw.is_null() {
            warn!(user = name, "could not look up user");
            None
        } else {
            Some(((*pw).pw_uid, (*pw).pw_gid))
        }
    }
}
