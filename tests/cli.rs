use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn montaine_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("montaine");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(config_dir.join("schemas")).unwrap();

    fs::write(
        config_dir.join("schemas/prices.mapping.json"),
        r#"{"@id":"meta.id","price":"data.price","seen":"data.seen"}"#,
    )
    .unwrap();

    fs::write(
        root.join("response.json"),
        r#"{"meta":{"id":"x1"},"data":{"price":"12,50 €","seen":"2024-02-30"}}"#,
    )
    .unwrap();

    // Port 1 is never listening, so runs fail at the fetch.
    let config_content = format!(
        r#"[db]
path = "{}/data/montaine.sqlite"

[fetch]
timeout_secs = 5

[integrations.prices]
url = "http://127.0.0.1:1/prices"
mapping_schema_file = "schemas/prices.mapping.json"
typing_schema = '{{"price":"NUMBER()","seen":"DATE()"}}'
save = true
"#,
        root.display()
    );

    let config_path = config_dir.join("montaine.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_montaine(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = montaine_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run montaine binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_montaine(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/montaine.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_montaine(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_montaine(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_integrations_lists_health() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_montaine(&config_path, &["integrations"]);
    assert!(success, "integrations failed: {}", stderr);
    assert!(stdout.contains("INTEGRATION"));
    assert!(stdout.contains("prices"));
    assert!(stdout.contains("true"));
}

#[test]
fn test_transform_prints_every_stage() {
    let (tmp, config_path) = setup_test_env();
    let input = tmp.path().join("response.json");

    let (stdout, stderr, success) = run_montaine(
        &config_path,
        &[
            "transform",
            "prices",
            "--input",
            input.to_str().unwrap(),
            "--observed-at",
            "2024-05-20T09:15:00Z",
        ],
    );
    assert!(success, "transform failed: {}", stderr);

    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(output["typed"]["price"], serde_json::json!(12.5));
    assert_eq!(
        output["typed"]["seen"],
        serde_json::json!("2024-03-01T00:00:00.000Z")
    );
    assert_eq!(
        output["historized"][0]["price"][0]["observedAt"],
        serde_json::json!("2024-05-20T09:15:00.000Z")
    );
    assert!(output["write_sets"][0]["base_upsert"].is_object());
}

#[test]
fn test_failed_run_exits_nonzero_and_is_recorded() {
    let (_tmp, config_path) = setup_test_env();
    run_montaine(&config_path, &["init"]);

    let (stdout, _, success) =
        run_montaine(&config_path, &["run", "prices", "--user", "ana", "--json"]);
    assert!(!success, "run against a closed port should fail");
    let outcome: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(outcome["error"]["code"], serde_json::json!("transport_error"));
    assert_eq!(outcome["entry"]["stage"], serde_json::json!("fetching"));

    let (stdout, stderr, success) = run_montaine(&config_path, &["history", "prices"]);
    assert!(success, "history failed: {}", stderr);
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("fetching"));
    assert!(stdout.contains("ana"));
}

#[test]
fn test_unknown_integration_is_an_error() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_montaine(&config_path, &["run", "nope"]);
    assert!(!success);
    assert!(stderr.contains("Available: prices"), "got: {}", stderr);
}

#[test]
fn test_missing_record_is_an_error() {
    let (_tmp, config_path) = setup_test_env();
    run_montaine(&config_path, &["init"]);

    let (_, stderr, success) = run_montaine(&config_path, &["record", "prices", "--id", "id=x1"]);
    assert!(!success);
    assert!(stderr.contains("no record"), "got: {}", stderr);
}

#[test]
fn test_completions() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_montaine(&config_path, &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("montaine"));
}
