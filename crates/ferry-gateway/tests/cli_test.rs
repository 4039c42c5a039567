#![allow(clippy::unwrap_used)]
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const CONFIG: &str = r#"
[executor]
command = ["cat"]

[[sessions]]
name = "main"
min_trust = "owner"
"#;

fn write_config(dir: &Path, toml: &str) -> PathBuf {
    let path = dir.join("ferry.toml");
    std::fs::write(&path, toml).unwrap();
    path
}

fn ferry(config: &Path, args: &[&str]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ferry"));
    command
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("RUST_LOG")
        .env_remove("FERRY_TRACE_FILE")
        .env_remove("FERRY_TRACE_LEVEL");
    command
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("invalid JSON: {e}\nstdout: {stdout}"))
}

#[test]
fn check_reports_json_and_exit_status() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_config(dir.path(), CONFIG);
    let output = ferry(&good, &["check", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["passed"], true);

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[executor]\ncommand = []\n").unwrap();
    let output = ferry(&bad, &["check"]).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("executor.command"));
}

#[test]
fn policy_shows_denied_route_for_untrusted_source() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CONFIG);
    let output = ferry(
        &config,
        &[
            "policy",
            "--source",
            "p2p",
            "--identity",
            "peer",
            "--session",
            "main",
        ],
    )
    .output()
    .unwrap();
    assert!(output.status.success());

    let json = stdout_json(&output);
    assert_eq!(json["policy"]["trust"], "untrusted");
    assert_eq!(json["direct"]["decision"], "denied");
    assert_eq!(json["route"]["route"], "deny");
}

#[test]
fn inject_runs_command_and_writes_traces() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CONFIG);
    let trace_file = dir.path().join("traces.jsonl");

    let output = ferry(&config, &["inject", "--session", "main", "hello"])
        .env("FERRY_TRACE_FILE", &trace_file)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let json = stdout_json(&output);
    assert_eq!(json["status"], "completed");
    assert_eq!(
        json["result"]["response"],
        "[From: cli | Trust: owner]\nhello"
    );

    let file = std::fs::File::open(&trace_file).unwrap();
    let lines: Vec<String> = std::io::BufReader::new(file)
        .lines()
        .map(|l| l.unwrap())
        .filter(|l| !l.is_empty())
        .collect();
    assert!(!lines.is_empty(), "trace file should not be empty");

    for line in &lines {
        let parsed: serde_json::Value = serde_json::from_str(line)
            .unwrap_or_else(|e| panic!("invalid JSON: {e}\nline: {line}"));
        assert!(parsed.get("timestamp").is_some(), "missing timestamp");
        assert!(parsed.get("level").is_some(), "missing level");
    }

    let all_text = lines.join("\n");
    assert!(all_text.contains("\"inject\""), "missing inject span");
    assert!(all_text.contains("ferry::audit"), "missing audit entry");
}

#[test]
fn inject_denied_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), CONFIG);

    let output = ferry(
        &config,
        &["inject", "--source", "cron", "--identity", "nightly", "hi"],
    )
    .output()
    .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let json = stdout_json(&output);
    assert_eq!(json["status"], "denied");
}
