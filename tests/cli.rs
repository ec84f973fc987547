use assert_cmd::Command;
use std::fs;

fn shepherd() -> Command {
    Command::cargo_bin("shepherd").unwrap()
}

const CONFIG: &str = r##"
[env]
GREETING = "hi"

[[command]]
name = "server"
description = "Reports where it listens"
run = "/bin/sh -c 'echo \"#! {\\\"type\\\":\\\"vars\\\",\\\"vars\\\":{\\\"Addr\\\":\\\"127.0.0.1:1\\\"}}\"; exec sleep 0.3'"
background = true
await_vars = ["Addr"]

[[command]]
name = "client"
run = "/bin/sh -c 'echo client ${GREETING} ${server.Addr}'"
"##;

#[test]
fn test_run_prints_awaited_vars() {
    let out = shepherd()
        .args(["run", "--quiet", "--await-var", "Addr", "--", "/bin/sh", "-c"])
        .arg(r#"echo '#! {"type":"vars","vars":{"Addr":"127.0.0.1:9"}}'; echo noise"#)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&out), "Addr=127.0.0.1:9\n");
}

#[test]
fn test_run_reports_child_failure() {
    shepherd()
        .args(["run", "--quiet", "--", "/bin/sh", "-c", "exit 2"])
        .assert()
        .failure();
}

#[test]
fn test_run_times_out() {
    shepherd()
        .args(["run", "--quiet", "--timeout", "1", "--", "/bin/sh", "-c", "exec sleep 30"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .failure();
}

#[test]
fn test_list() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shepherd.toml");
    fs::write(&path, CONFIG).unwrap();
    let out = shepherd()
        .args(["list", "-c"])
        .arg(&path)
        .env("NO_COLOR", "1")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let out = String::from_utf8_lossy(&out);
    assert!(out.contains("server"), "{}", out);
    assert!(out.contains("vars: Addr"), "{}", out);
    assert!(out.contains("Reports where it listens"), "{}", out);
}

#[test]
fn test_up_dry_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shepherd.toml");
    fs::write(&path, CONFIG).unwrap();
    let out = shepherd()
        .args(["up", "-n", "-c"])
        .arg(&path)
        .env("NO_COLOR", "1")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let out = String::from_utf8_lossy(&out);
    assert!(out.contains("[DRY-RUN] server"), "{}", out);
    assert!(out.contains("client hi ${server.Addr}"), "{}", out);
}

#[test]
fn test_up_passes_reported_vars_along() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shepherd.toml");
    fs::write(&path, CONFIG).unwrap();
    let out = shepherd()
        .args(["up", "-c"])
        .arg(&path)
        .env("NO_COLOR", "1")
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let out = String::from_utf8_lossy(&out);
    assert!(out.contains("client hi 127.0.0.1:1"), "{}", out);
}

#[test]
fn test_missing_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    shepherd()
        .args(["up", "-c"])
        .arg(dir.path().join("shepherd.toml"))
        .assert()
        .failure();
}

#[test]
fn test_demo() {
    let out = shepherd()
        .arg("demo")
        .env("NO_COLOR", "1")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let out = String::from_utf8_lossy(&out);
    assert!(out.contains("hello 127.0.0.1:"), "{}", out);
}

// Sends `sig` to a supervising `shepherd run` and checks it tears down its child.
fn assert_signal_cleans_up(sig: libc::c_int) {
    use std::io::{BufRead, BufReader, Read};
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    let mut proc = std::process::Command::new(assert_cmd::cargo::cargo_bin("shepherd"))
        .args(["run", "--quiet", "--await-ready", "--await-var", "Pid", "--", "/bin/sh", "-c"])
        .arg(r##"echo "#! {\"type\":\"vars\",\"vars\":{\"Pid\":\"$$\"}}"; echo '#! {"type":"ready"}'; exec sleep 30"##)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let mut line = String::new();
    BufReader::new(proc.stdout.take().unwrap()).read_line(&mut line).unwrap();
    let child: libc::pid_t = line.trim().strip_prefix("Pid=").unwrap().parse().unwrap();

    let rc = unsafe { libc::kill(proc.id() as libc::pid_t, sig) };
    assert_eq!(rc, 0);
    let status = proc.wait().unwrap();
    assert_eq!(status.code(), Some(1));

    // The child gets reaped by us or, once we are gone, by init.
    let deadline = Instant::now() + Duration::from_secs(5);
    while unsafe { libc::kill(child, 0) } == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_ne!(unsafe { libc::kill(child, 0) }, 0, "child {} still alive", child);

    let mut stderr = String::new();
    proc.stderr.take().unwrap().read_to_string(&mut stderr).unwrap();
    assert!(!stderr.contains("already called"), "{}", stderr);
}

#[test]
fn test_sigterm_cleans_up_and_exits_1() {
    assert_signal_cleans_up(libc::SIGTERM);
}

#[test]
fn test_sighup_cleans_up_and_exits_1() {
    assert_signal_cleans_up(libc::SIGHUP);
}
