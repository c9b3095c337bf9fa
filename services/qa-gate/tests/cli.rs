use assert_cmd::Command;
use predicates::str::contains;
use std::path::PathBuf;
use tempfile::TempDir;

fn cmd() -> Command {
    Command::cargo_bin("qa-gate").unwrap()
}

fn metrics(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let p = dir.path().join(name);
    std::fs::write(&p, body).unwrap();
    p
}

fn gate(baseline: &PathBuf, candidate: &PathBuf) -> Command {
    let mut c = cmd();
    c.arg("--baseline").arg(baseline).arg("--candidate").arg(candidate).env("RUST_LOG", "off");
    c
}

#[test]
fn pass_exits_zero() {
    let dir = TempDir::new().unwrap();
    let b = metrics(&dir, "b.json", r#"{"accuracy":0.80,"labels":["a","b"]}"#);
    let c = metrics(&dir, "c.json", r#"{"accuracy":0.79,"labels":["a","b"],"f1_macro":0.7}"#);
    gate(&b, &c).assert().code(0).stdout(contains("Baseline accuracy: 0.8000")).stdout(contains("PASS"));
}

#[test]
fn regression_exits_one() {
    let dir = TempDir::new().unwrap();
    let b = metrics(&dir, "b.json", r#"{"accuracy":0.80,"labels":["a"]}"#);
    let c = metrics(&dir, "c.json", r#"{"accuracy":0.78,"labels":["a"]}"#);
    gate(&b, &c).assert().code(1).stderr(contains("FAIL: accuracy dropped beyond tolerance"));
}

#[test]
fn label_shrink_exits_one() {
    let dir = TempDir::new().unwrap();
    let b = metrics(&dir, "b.json", r#"{"accuracy":0.80,"labels":["a","b","c"]}"#);
    let c = metrics(&dir, "c.json", r#"{"accuracy":0.95,"labels":["a","b"]}"#);
    gate(&b, &c).assert().code(1).stderr(contains("does not cover baseline"));
}

#[test]
fn missing_file_exits_two() {
    let dir = TempDir::new().unwrap();
    let b = metrics(&dir, "b.json", r#"{"accuracy":0.80,"labels":["a"]}"#);
    let missing = dir.path().join("nope.json");
    gate(&b, &missing).assert().code(2).stderr(contains("missing file"));
}

#[test]
fn malformed_or_missing_accuracy_exits_two() {
    let dir = TempDir::new().unwrap();
    let b = metrics(&dir, "b.json", r#"{"accuracy":0.80,"labels":["a"]}"#);
    let bad = metrics(&dir, "bad.json", "{oops");
    gate(&b, &bad).assert().code(2);
    let no_acc = metrics(&dir, "noacc.json", r#"{"labels":["a"]}"#);
    gate(&b, &no_acc).assert().code(2).stderr(contains("Invalid metrics.json contents"));
}

#[test]
fn custom_tolerance_and_json_output() {
    let dir = TempDir::new().unwrap();
    let b = metrics(&dir, "b.json", r#"{"accuracy":0.80,"labels":["a"]}"#);
    let c = metrics(&dir, "c.json", r#"{"accuracy":0.75,"labels":["a"]}"#);
    gate(&b, &c).args(["--tolerance", "0.1", "--json"]).assert().code(0).stdout(contains("\"outcome\": \"pass\""));
    gate(&b, &c).args(["--tolerance", "-0.1"]).assert().code(2);
}

#[test]
fn json_logs_stay_on_stderr_and_verdict_on_stdout() {
    let dir = TempDir::new().unwrap();
    let b = metrics(&dir, "b.json", r#"{"accuracy":0.80,"labels":["a"]}"#);
    let c = metrics(&dir, "c.json", r#"{"accuracy":0.81,"labels":["a"]}"#);
    let out = gate(&b, &c).arg("--json").env("RUST_LOG", "info").env("SEVERITY_JSON_LOG", "1").output().unwrap();
    assert_eq!(out.status.code(), Some(0));
    let verdict: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(verdict["outcome"], "pass");
    let stderr = String::from_utf8(out.stderr).unwrap();
    assert!(!stderr.contains("logging disabled"), "{stderr}");
    let event = stderr.lines().find(|l| l.contains("gate evaluated")).unwrap();
    let event: serde_json::Value = serde_json::from_str(event).unwrap();
    assert_eq!(event["outcome"], "Pass");
}

#[test]
fn numeric_string_accuracy_is_accepted() {
    let dir = TempDir::new().unwrap();
    let b = metrics(&dir, "b.json", r#"{"accuracy":"0.8","labels":["a"]}"#);
    let c = metrics(&dir, "c.json", r#"{"accuracy":0.795,"labels":["a"]}"#);
    gate(&b, &c).assert().code(0).stdout(contains("Baseline accuracy: 0.8000"));
    let bad = metrics(&dir, "bad.json", r#"{"accuracy":"high","labels":["a"]}"#);
    gate(&b, &bad).assert().code(2);
}
