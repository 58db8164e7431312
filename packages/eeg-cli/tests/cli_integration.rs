use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn eegrec() -> Command {
    let mut cmd = Command::cargo_bin("eegrec").unwrap();
    for var in [
        "EEG_CONFIG",
        "EEG_DIAGNOSIS_ID",
        "EEG_BUFFER_CAPACITY",
        "EEG_DISPLAY_WINDOW",
        "EEG_FLUSH_DIVISOR",
        "EEG_STAGE_DURATIONS_MS",
        "EEG_SHUTDOWN_GRACE_MS",
        "EEG_SENSOR_ID",
        "EEG_AUTO_START",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

// =============================================================================
// GENERAL
// =============================================================================

#[test]
fn test_no_args_shows_help() {
    eegrec()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_version_flag() {
    eegrec()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("eegrec"));
}

#[test]
fn test_help_flag() {
    eegrec()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("simulate"))
        .stdout(predicate::str::contains("validate"));
}

// =============================================================================
// CONFIG SUBCOMMAND
// =============================================================================

#[test]
fn test_config_defaults() {
    eegrec()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Buffer capacity:   500"))
        .stdout(predicate::str::contains("3:70000ms"));
}

#[test]
fn test_config_json_with_env_override() {
    let output = eegrec()
        .arg("config")
        .arg("--json")
        .env("EEG_BUFFER_CAPACITY", "1000")
        .env("EEG_STAGE_DURATIONS_MS", "3:5000")
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["capacity"], 1000);
    assert_eq!(parsed["stage_durations_ms"]["3"], 5000);
    assert_eq!(parsed["stage_durations_ms"]["1"], 10000);
}

#[test]
fn test_config_from_file() {
    let file = config_file(r#"{"sensor_id": "test-rig", "display_window": 250}"#);
    eegrec()
        .arg("config")
        .arg("--config")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("test-rig"))
        .stdout(predicate::str::contains("Display window:    250"));
}

#[test]
fn test_config_bad_env_value() {
    eegrec()
        .arg("config")
        .env("EEG_FLUSH_DIVISOR", "often")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("EEG_FLUSH_DIVISOR"));
}

// =============================================================================
// VALIDATE SUBCOMMAND
// =============================================================================

#[test]
fn test_validate_nonexistent_file() {
    eegrec()
        .arg("validate")
        .arg("--file")
        .arg("/nonexistent/pipeline.json")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_validate_valid_file() {
    let file = config_file(r#"{"capacity": 1000}"#);
    eegrec()
        .arg("validate")
        .arg("--file")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"));
}

#[test]
fn test_validate_window_larger_than_capacity() {
    let file = config_file(r#"{"capacity": 100, "display_window": 125}"#);
    let output = eegrec()
        .arg("validate")
        .arg("--file")
        .arg(file.path())
        .arg("--json")
        .assert()
        .failure()
        .code(2);

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(parsed["parsed"], true);
    assert_eq!(parsed["valid"], false);
    assert!(parsed["error"].as_str().unwrap().contains("display_window"));
}

#[test]
fn test_validate_malformed_json() {
    let file = config_file("{not json");
    eegrec()
        .arg("validate")
        .arg("--file")
        .arg(file.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Failed to parse"));
}

// =============================================================================
// SIMULATE SUBCOMMAND
// =============================================================================

#[test]
fn test_simulate_short_run_json() {
    let output = eegrec()
        .args(["simulate", "--stage-ms", "1:60,2:60,3:120,4:60"])
        .args(["--grace-ms", "30", "--eval-delay-ms", "10", "--seed", "7"])
        .args(["--diagnosis-id", "42", "--json", "--quiet"])
        .assert()
        .success();

    let stdout = String::from_utf8(output.get_output().stdout.clone()).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&stdout).unwrap();

    let actions: Vec<&str> = parsed["commands"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["action"].as_str().unwrap())
        .collect();
    assert_eq!(&actions[..6], &["start", "stage", "stage", "evaluate", "stage", "stop"]);
    assert!(parsed["commands"]
        .as_array()
        .unwrap()
        .iter()
        .all(|c| c["diagnosisId"] == 42));

    assert_eq!(parsed["evaluation"]["diagnosisStage"], 3);
    assert_eq!(parsed["display_windows"]["fp1"].as_array().unwrap().len(), 125);
    assert!(parsed["bursts_sent"].as_u64().unwrap() > 0);
}

#[test]
fn test_simulate_writes_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("summary.json");

    eegrec()
        .args(["simulate", "--stage-ms", "1:40,2:40,3:40,4:40", "--grace-ms", "20"])
        .args(["--eval-delay-ms", "5", "--quiet", "-o"])
        .arg(&path)
        .assert()
        .success();

    let contents = std::fs::read_to_string(&path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert!(parsed["session_id"].is_string());
}

#[test]
fn test_simulate_rejects_untimed_stage() {
    eegrec()
        .args(["simulate", "--stage-ms", "1:50,2:0"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Stage 2"));
}

#[test]
fn test_simulate_rejects_invalid_config() {
    let file = config_file(r#"{"channels": []}"#);
    eegrec()
        .arg("simulate")
        .arg("--config")
        .arg(file.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("channel"));
}
