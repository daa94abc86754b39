mod common;

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::tempdir;

use common::{test_settings, write_normalized_dataset};

fn write_config(dir: &Path) -> PathBuf {
    let settings = test_settings(dir);
    let path = dir.join("cohort-flow.yaml");
    std::fs::write(&path, serde_yaml::to_string(&settings).unwrap()).unwrap();
    path
}

fn cohort_flow() -> Command {
    Command::cargo_bin("cohort-flow").expect("binary present")
}

#[test]
fn list_stages_prints_the_registry() {
    let output = cohort_flow().arg("list-stages").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Available stages:"));
    let stages = [
        "data_quality",
        "evaluate_cohort",
        "monitor_model",
        "train_model",
        "validate_model",
    ];
    for stage in stages {
        assert!(stdout.contains(&format!("- {stage}")), "missing {stage}: {stdout}");
    }
}

#[test]
fn validate_passes_with_warnings_and_fails_on_errors() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path());
    cohort_flow()
        .args(["validate", "--config"])
        .arg(&config)
        .assert()
        .success();

    std::fs::write(&config, "version: 3\n").unwrap();
    let output = cohort_flow()
        .args(["validate", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("validation failed"));
}

#[test]
fn fetch_of_unknown_run_fails() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path());
    let output = cohort_flow()
        .args(["fetch", "no-such-run", "--config"])
        .arg(&config)
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no-such-run"));
}

#[test]
fn monitor_prints_flow_and_artifact_ids() {
    let temp = tempdir().unwrap();
    let config = write_config(temp.path());
    let working_dir = temp.path().join("data");
    std::fs::create_dir_all(&working_dir).unwrap();
    write_normalized_dataset(&working_dir.join("games.csv"), 300, 9);

    // a model file outside the registry is scored directly
    let model_path = temp.path().join("model.json");
    std::fs::write(
        &model_path,
        r#"{"algorithm": "majority_class", "label": "0 - 20000"}"#,
    )
    .unwrap();

    let blob = serde_json::json!({
        "args": [working_dir.display().to_string(), "games.csv", "forest", "drift.json"],
        "kwargs": { "model_path": model_path.display().to_string() },
    })
    .to_string();
    let metrics = temp.path().join("metrics").join("run.prom");

    let output = cohort_flow()
        .arg("--config")
        .arg(&config)
        .arg("--metrics-prometheus")
        .arg(&metrics)
        .args(["monitor", &blob])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Flow ID: "));
    assert!(stdout.contains("Artifact ID: "));

    assert!(working_dir.join("drift.json").is_file());
    let prometheus = std::fs::read_to_string(&metrics).unwrap();
    assert!(prometheus.contains("stage=\"monitor_model\""));
    let flow_seconds: f64 = prometheus
        .lines()
        .find_map(|line| line.strip_prefix("cohort_flow_duration_seconds "))
        .expect("flow duration line")
        .parse()
        .unwrap();
    assert!(flow_seconds > 0.0, "{prometheus}");
}
