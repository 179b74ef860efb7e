//! End-to-end checks of the subtool binaries

use std::io::Write;
use std::process::{Command, Stdio};

fn run_check_reload(input: &str) -> (String, i32) {
    let mut child = Command::new(env!("CARGO_BIN_EXE_cache-agent-check-reload"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawning check-reload");
    child
        .stdin
        .as_mut()
        .expect("stdin")
        .write_all(input.as_bytes())
        .expect("writing stdin");
    let out = child.wait_with_output().expect("waiting for check-reload");
    (
        String::from_utf8_lossy(&out.stdout).trim().to_string(),
        out.status.code().unwrap_or(-1),
    )
}

#[test]
fn test_check_reload_restart_sentinel() {
    let (out, code) = run_check_reload(
        r#"{"changed_files": "/opt/trafficserver/etc/trafficserver/plugin.config"}"#,
    );
    assert_eq!(out, "needs-restart");
    assert_eq!(code, 0);
}

#[test]
fn test_check_reload_reload_sentinel() {
    let (out, code) = run_check_reload(
        r#"{"changed_files": "/opt/trafficserver/etc/records.config, /etc/cron.d/x"}"#,
    );
    assert_eq!(out, "needs-reload");
    assert_eq!(code, 0);
}

#[test]
fn test_check_reload_nothing_sentinel() {
    let (out, code) = run_check_reload(r#"{"changed_files": "/etc/cron.d/ats-cleanup"}"#);
    assert_eq!(out, "nothing");
    assert_eq!(code, 0);
}

#[test]
fn test_check_reload_new_trafficserver_package() {
    let (out, _) = run_check_reload(
        r#"{"changed_files": "", "installed_packages": "trafficserver-9.2.0"}"#,
    );
    assert_eq!(out, "needs-restart");
}

#[test]
fn test_diff_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    let generated = dir.path().join("generated.config");
    let disk = dir.path().join("disk.config");
    std::fs::write(&generated, "CONFIG a INT 1\n").unwrap();
    std::fs::write(&disk, "# comment only difference\nCONFIG a INT 1\n").unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_cache-agent-diff"))
        .arg(&generated)
        .arg(&disk)
        .status()
        .expect("running diff");
    assert_eq!(status.code(), Some(0));

    std::fs::write(&disk, "CONFIG a INT 2\n").unwrap();
    let out = Command::new(env!("CARGO_BIN_EXE_cache-agent-diff"))
        .arg(&generated)
        .arg(&disk)
        .output()
        .expect("running diff");
    assert_eq!(out.status.code(), Some(1));
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("- CONFIG a INT 2"));
    assert!(text.contains("+ CONFIG a INT 1"));
}

#[test]
fn test_preprocess_rewrites_remap_overrides() {
    let input = "\
map http://a / http://origin / @plugin=p.so @pparam=foo
##OVERRIDE## map http://a / http://origin2 / @plugin=p.so @pparam=foo
";
    let mut child = Command::new(env!("CARGO_BIN_EXE_cache-agent-preprocess"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawning preprocess");
    child.stdin.as_mut().unwrap().write_all(input.as_bytes()).unwrap();
    let out = child.wait_with_output().expect("waiting for preprocess");

    let text = String::from_utf8_lossy(&out.stdout);
    assert_eq!(
        text,
        "\
##OVERRIDE##
map http://a / http://origin2 / @plugin=p.so @pparam=foo
##OVERRIDDEN## map http://a / http://origin / @plugin=p.so @pparam=foo
"
    );
}

#[test]
fn test_dispatcher_rejects_unknown_command() {
    let out = Command::new(env!("CARGO_BIN_EXE_cache-agent"))
        .arg("frobnicate")
        .output()
        .expect("running dispatcher");
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_dispatcher_requires_a_command() {
    let out = Command::new(env!("CARGO_BIN_EXE_cache-agent"))
        .output()
        .expect("running dispatcher");
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn test_check_refs_verifies_against_plugin_dir() {
    let dir = tempfile::tempdir().unwrap();
    let plugin_dir = dir.path().join("plugins");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    std::fs::write(plugin_dir.join("regex_revalidate.so"), b"").unwrap();
    let config = dir.path().join("remap.config");
    std::fs::write(&config, "map http://a/ http://o/ x @plugin=regex_revalidate.so\n").unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_cache-agent-check-refs"))
        .arg(&config)
        .arg("--ts-plugin-dir")
        .arg(&plugin_dir)
        .arg("--ts-config-dir")
        .arg(dir.path())
        .status()
        .expect("running check-refs");
    assert_eq!(status.code(), Some(0));

    std::fs::write(&config, "map http://a/ http://o/ x @plugin=missing.so\n").unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_cache-agent-check-refs"))
        .arg(&config)
        .arg("--ts-plugin-dir")
        .arg(&plugin_dir)
        .arg("--ts-config-dir")
        .arg(dir.path())
        .status()
        .expect("running check-refs");
    assert_eq!(status.code(), Some(1));
}
