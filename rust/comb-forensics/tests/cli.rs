//! Exit-code contract of the `comb-forensics` binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_comb-forensics"));
    cmd.args(["--log-level", "warn"]);
    cmd
}

fn exec(cmd: &mut Command) -> Output {
    cmd.output().expect("binary runs")
}

fn code(out: &Output) -> i32 {
    out.status.code().expect("exit code")
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        Fixture { _dir: dir, root }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn synth(&self, name: &str, amplitude: &str, seed: &str) -> PathBuf {
        let out = self.path(name);
        let result = exec(bin().args(["synth", "--points", "600", "--period", "16"]).args([
            "--amplitude",
            amplitude,
            "--seed",
            seed,
            "--output",
        ]).arg(&out));
        assert_eq!(code(&result), 0, "{}", String::from_utf8_lossy(&result.stderr));
        out
    }

    fn register(&self, files: &[&Path]) -> PathBuf {
        let manifest = self.path("manifest.json");
        let result = exec(bin().arg("register").arg("--manifest").arg(&manifest).args(files));
        assert_eq!(code(&result), 0, "{}", String::from_utf8_lossy(&result.stderr));
        manifest
    }

    fn protocol(&self, extra: &str) -> PathBuf {
        let path = self.path("protocol.toml");
        let text = format!(
            r#"protocol_version = "cli-test"
predicted_period = 16
seed = 42
n_samples = 49
candidate_periods = [8, 16, 32]
{extra}
[null]
method = "label_permutation"
"#
        );
        std::fs::write(&path, text).unwrap();
        path
    }
}

fn run_cmd(protocol: &Path, manifest: &Path, observed: &Path, output: &Path) -> Output {
    exec(&mut run_args(protocol, manifest, observed, output))
}

fn run_args(protocol: &Path, manifest: &Path, observed: &Path, output: &Path) -> Command {
    let mut cmd = bin();
    cmd.arg("run")
        .arg("--protocol")
        .arg(protocol)
        .arg("--manifest")
        .arg(manifest)
        .arg("--observed")
        .arg(observed)
        .arg("--output")
        .arg(output);
    cmd
}

fn read_report(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

fn assert_stopped(report: &serde_json::Value, status: &str) {
    assert_eq!(report["status"], status);
    assert!(!report["reason"].as_str().unwrap().is_empty());
    assert_eq!(report["verdicts"].as_array().unwrap().len(), 0);
}

#[test]
fn test_completed_run_exits_zero_and_writes_report() {
    let fx = Fixture::new();
    let obs = fx.synth("obs.txt", "1.0", "1");
    let manifest = fx.register(&[&obs]);
    let protocol = fx.protocol("");
    let report = fx.path("report.json");

    let out = run_cmd(&protocol, &manifest, &obs, &report);
    assert_eq!(code(&out), 0, "{}", String::from_utf8_lossy(&out.stderr));
    let json = read_report(&report);
    assert_eq!(json["status"], "completed");
    assert!(json["reason"].is_null());
    assert_eq!(json["verdicts"][0]["best_period"], 16);
    assert_eq!(json["verdicts"][0]["periods"].as_array().unwrap().len(), 3);
}

#[test]
fn test_failed_verdict_still_exits_zero() {
    let fx = Fixture::new();
    let obs = fx.synth("noise.txt", "0", "2");
    let manifest = fx.register(&[&obs]);
    let out = run_cmd(&fx.protocol(""), &manifest, &obs, &fx.path("report.json"));
    assert_eq!(code(&out), 0);
}

#[test]
fn test_tampered_dataset_exits_two() {
    let fx = Fixture::new();
    let obs = fx.synth("obs.txt", "1.0", "1");
    let manifest = fx.register(&[&obs]);
    let mut bytes = std::fs::read(&obs).unwrap();
    let last = bytes.len() - 2;
    bytes[last] = if bytes[last] == b'1' { b'2' } else { b'1' };
    std::fs::write(&obs, bytes).unwrap();

    let verify = exec(bin().arg("verify").arg("--manifest").arg(&manifest).arg(&obs));
    assert_eq!(code(&verify), 2);

    let report = fx.path("report.json");
    let out = run_cmd(&fx.protocol(""), &manifest, &obs, &report);
    assert_eq!(code(&out), 2);
    let json = read_report(&report);
    assert_stopped(&json, "provenance_failure");
    assert!(json["reason"].as_str().unwrap().contains("obs.txt"));
}

#[test]
fn test_mismatched_registered_fingerprint_exits_three() {
    let fx = Fixture::new();
    let obs = fx.synth("obs.txt", "1.0", "1");
    let manifest = fx.register(&[&obs]);
    let protocol = fx.protocol(&format!("registered_fingerprint = \"{}\"", "0".repeat(64)));

    let lock = exec(bin().arg("lock").arg("--protocol").arg(&protocol));
    assert_eq!(code(&lock), 3);
    let report = fx.path("report.json");
    let out = run_cmd(&protocol, &manifest, &obs, &report);
    assert_eq!(code(&out), 3);
    assert_stopped(&read_report(&report), "protocol_violation");
}

#[test]
fn test_cancelled_run_exits_four_with_cancelled_report() {
    let fx = Fixture::new();
    let obs = fx.synth("obs.txt", "1.0", "1");
    let manifest = fx.register(&[&obs]);
    let report = fx.path("report.json");

    let out = exec(
        run_args(&fx.protocol(""), &manifest, &obs, &report).args(["--deadline-secs", "0"]),
    );
    assert_eq!(code(&out), 4);
    let json = read_report(&report);
    assert_stopped(&json, "cancelled");
    assert!(json["reason"].as_str().unwrap().contains("of 49 null draws"));
}

#[test]
fn test_malformed_dataset_exits_one_with_failed_report() {
    let fx = Fixture::new();
    let obs = fx.path("bad.txt");
    std::fs::write(&obs, "2 1.0\n2 3.0\n").unwrap();
    let manifest = fx.register(&[&obs]);
    let report = fx.path("report.json");

    let out = run_cmd(&fx.protocol(""), &manifest, &obs, &report);
    assert_eq!(code(&out), 1);
    assert_stopped(&read_report(&report), "failed");
}

#[test]
fn test_lock_prints_fingerprint_that_then_verifies() {
    let fx = Fixture::new();
    let protocol = fx.protocol("");
    let out = exec(bin().arg("lock").arg("--protocol").arg(&protocol));
    assert_eq!(code(&out), 0);
    let stdout = String::from_utf8(out.stdout).unwrap();
    let fingerprint = stdout
        .lines()
        .find_map(|l| l.strip_prefix("fingerprint: "))
        .unwrap()
        .to_string();
    assert_eq!(fingerprint.len(), 64);

    let registered = fx.protocol(&format!("registered_fingerprint = \"{fingerprint}\""));
    let again = exec(bin().arg("lock").arg("--protocol").arg(&registered));
    assert_eq!(code(&again), 0);
    assert!(!String::from_utf8(again.stdout).unwrap().contains("not pre-registered"));
}
