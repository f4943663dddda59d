use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn holo_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("holo");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let feed = [
        r#"{"id": "sym:limiter", "kind": "code_symbol", "source_path": "src/net/rate_limiter.rs", "content": "pub struct RateLimiter rate limiter for outbound requests", "structure": {"line_count": 120, "change_count": 3, "fan_in": 14, "documented": true}}"#,
        r#"{"id": "sym:retry", "kind": "code_symbol", "source_path": "src/net/retry.rs", "content": "pub fn retry_with_backoff exponential backoff"}"#,
        r#"{"id": "doc:retries", "kind": "doc_section", "source_path": "docs/retries.md", "content": "Retries protocol docs: how the client retries failed requests"}"#,
        r#"{"id": "doc:wsp", "kind": "doc_section", "source_path": "WSP_framework/WSP_50.md", "content": "Protocol guidance for docs and retries"}"#,
        "this line is not json",
    ];
    fs::write(root.join("entities.jsonl"), feed.join("\n")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/holo.sqlite"

[embedding]
provider = "disabled"

[retrieval]
top_k = 5

[orchestration]
component_timeout_ms = 2000
"#,
        root.display()
    );

    let config_path = config_dir.join("holo.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_holo(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = holo_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run holo binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn feed_path(config_path: &Path) -> String {
    let root = config_path.parent().unwrap().parent().unwrap();
    root.join("entities.jsonl").to_str().unwrap().to_string()
}

fn ingested_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    run_holo(&config_path, &["init"]);
    let feed = feed_path(&config_path);
    let (stdout, stderr, success) = run_holo(&config_path, &["ingest", &feed]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    (tmp, config_path)
}

fn query_id(config_path: &Path, text: &str) -> String {
    let (stdout, stderr, success) = run_holo(config_path, &["query", text, "--json"]);
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    response["query_id"].as_str().unwrap().to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_holo(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_holo(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_holo(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_counts_records() {
    let (_tmp, config_path) = setup_test_env();
    run_holo(&config_path, &["init"]);
    let feed = feed_path(&config_path);

    let (stdout, stderr, success) = run_holo(&config_path, &["ingest", &feed]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("upserted: 4"));
    assert!(stdout.contains("rejected: 1"));
    assert!(stdout.contains("ok"));

    // Second run finds nothing to rewrite
    let (stdout, _, _) = run_holo(&config_path, &["ingest", &feed]);
    assert!(stdout.contains("upserted: 0"));
    assert!(stdout.contains("unchanged: 4"));
}

#[test]
fn test_query_lexical_fallback() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, stderr, success) = run_holo(&config_path, &["query", "find the rate limiter"]);
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("CODE_LOCATION"));
    assert!(stdout.contains("src/net/rate_limiter.rs"));
    assert!(stdout.contains("lexical fallback"));
}

#[test]
fn test_query_json_output() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, success) = run_holo(
        &config_path,
        &["query", "explain the protocol docs for retries", "--json"],
    );
    assert!(success);
    let response: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(response["output"]["intent"], "DOC_LOOKUP");
    assert_eq!(response["state"], "done");
    assert!(response["runs"].as_array().unwrap().len() >= 3);
}

#[test]
fn test_feedback_updates_weights() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, _, _) = run_holo(&config_path, &["weights"]);
    assert!(stdout.contains("No learned weights yet"));

    let id = query_id(&config_path, "explain the protocol docs for retries");
    let (stdout, stderr, success) = run_holo(
        &config_path,
        &[
            "feedback",
            &id,
            "--relevance",
            "0.9",
            "--noise",
            "0.1",
            "--completeness",
            "0.8",
            "--efficiency",
            "0.9",
        ],
    );
    assert!(success, "feedback failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("delta: +0.1875"));

    let (stdout, _, success) = run_holo(&config_path, &["weights", "--intent", "doc_lookup"]);
    assert!(success);
    assert!(stdout.contains("doc-search"));
    assert!(stdout.contains("+0.1875"));
}

#[test]
fn test_feedback_out_of_range_rejected() {
    let (_tmp, config_path) = ingested_env();
    let id = query_id(&config_path, "find the rate limiter");

    let (_, stderr, success) = run_holo(
        &config_path,
        &[
            "feedback",
            &id,
            "--relevance",
            "1.5",
            "--noise",
            "0.1",
            "--completeness",
            "0.8",
            "--efficiency",
            "0.9",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("relevance"));
}

#[test]
fn test_unknown_intent_rejected() {
    let (_tmp, config_path) = ingested_env();

    let (_, stderr, success) = run_holo(&config_path, &["weights", "--intent", "gossip"]);
    assert!(!success);
    assert!(stderr.contains("Unknown intent"));
}

#[test]
fn test_health_reports_structure() {
    let (_tmp, config_path) = ingested_env();

    let (stdout, stderr, success) = run_holo(&config_path, &["health", "sym:limiter", "--json"]);
    assert!(success, "health failed: stdout={}, stderr={}", stdout, stderr);
    let score: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(score["entity_id"], "sym:limiter");
    assert!(score["doc_coverage"].as_f64().unwrap() > 0.0);

    let (stdout, _, success) = run_holo(&config_path, &["foundational", "--top", "1.0"]);
    assert!(success);
    assert!(stdout.contains("sym:limiter"));
}

#[test]
fn test_trail_and_prune() {
    let (_tmp, config_path) = ingested_env();
    let id = query_id(&config_path, "find the rate limiter");

    let (stdout, _, success) = run_holo(&config_path, &["trail", "--query", &id]);
    assert!(success);
    assert!(stdout.contains("classified"));
    assert!(stdout.contains("done"));

    let (stdout, _, success) = run_holo(&config_path, &["prune", "--days", "30"]);
    assert!(success);
    assert!(stdout.contains("breadcrumbs removed: 0"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (_, stderr, success) = run_holo(&missing, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_completions_need_no_config() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (stdout, _, success) = run_holo(&missing, &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("holo"));
}
