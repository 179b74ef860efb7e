//! Comparison of generated config against disk
//!
//! Comments and line-ending differences never count as a change, so a
//! node whose files differ only in comment banners is left alone.

use anyhow::{Context, Result};
use std::path::Path;

/// Normalize a config body for comparison: CRLF to LF, comment lines
/// dropped, whitespace runs collapsed, HTML escapes undone.
pub fn normalize_for_diff(body: &str) -> Vec<String> {
    let body = body.replace("\r\n", "\n");
    body.trim()
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(unencode)
        .filter(|line| !line.is_empty())
        .collect()
}

fn unencode(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last_space = false;
    for c in line.trim().chars() {
        if c.is_whitespace() {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            last_space = false;
            out.push(c);
        }
    }
    out.replace("amp;", "").replace("&lt;", "<").replace("&gt;", ">")
}

/// Whether the generated bytes differ from what is on disk. A missing
/// destination file always counts as a change.
pub fn files_differ(generated: &[u8], disk_path: &Path) -> Result<bool> {
    if !disk_path.exists() {
        return Ok(true);
    }
    let disk = std::fs::read(disk_path)
        .with_context(|| format!("reading {}", disk_path.display()))?;
    let generated = String::from_utf8_lossy(generated);
    let disk = String::from_utf8_lossy(&disk);
    Ok(normalize_for_diff(&generated) != normalize_for_diff(&disk))
}

/// Line diff for the diff subtool: `-` lines are on disk but not in the
/// generated config, `+` lines are generated but not on disk.
pub fn diff_lines(generated: &str, disk: &str) -> Vec<String> {
    let new_lines = normalize_for_diff(generated);
    let old_lines = normalize_for_diff(disk);
    let mut out = Vec::new();
    for line in &old_lines {
        if !new_lines.contains(line) {
            out.push(format!("- {line}"));
        }
    }
    for line in &new_lines {
        if !old_lines.contains(line) {
            out.push(format!("+ {line}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comment_only_difference_is_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.config");
        std::fs::write(&path, "# generated Tuesday\nCONFIG proxy.config.http.server_ports INT 8080\n").unwrap();

        let generated = b"# generated Wednesday\nCONFIG proxy.config.http.server_ports INT 8080\n";
        assert!(!files_differ(generated, &path).unwrap());
    }

    #[test]
    fn test_crlf_difference_is_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.config");
        std::fs::write(&path, "CONFIG a INT 1\r\nCONFIG b INT 2\r\n").unwrap();

        assert!(!files_differ(b"CONFIG a INT 1\nCONFIG b INT 2\n", &path).unwrap());
    }

    #[test]
    fn test_value_difference_is_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.config");
        std::fs::write(&path, "CONFIG a INT 1\n").unwrap();

        assert!(files_differ(b"CONFIG a INT 2\n", &path).unwrap());
    }

    #[test]
    fn test_missing_file_is_a_change() {
        let dir = tempfile::tempdir().unwrap();
        assert!(files_differ(b"x\n", &dir.path().join("absent.config")).unwrap());
    }

    #[test]
    fn test_diff_lines_direction() {
        let out = diff_lines("keep\nadded\n", "keep\nremoved\n");
        assert_eq!(out, vec!["- removed".to_string(), "+ added".to_string()]);
    }

    #[test]
    fn test_unencode_collapses_whitespace_and_escapes() {
        let lines = normalize_for_diff("map   http://a\t/  &lt;x&gt;\n");
        assert_eq!(lines, vec!["map http://a / <x>".to_string()]);
    }
}
