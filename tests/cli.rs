//! Offline checks of the `crag` binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("pricing.md"),
        "# Pricing\n\nEnterprise tier includes SSO and audit logs.",
    )
    .unwrap();
    fs::write(files_dir.join("export.csv"), "id,name\n1,Jane").unwrap();

    let config_content = format!(
        r#"[index]
path = "{root}/data/index"
collection = "cli_docs"

[chunking]
chunk_size = 400
chunk_overlap = 40

[embedding]
provider = "disabled"

[hubspot]
cache_path = "{root}/data/hubspot_cache.sqlite"

[identity]
path = "{root}/data/identity.sqlite"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("crag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_crag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_crag"))
        .arg("--config")
        .arg(config_path)
        .arg("--progress")
        .arg("off")
        .args(args)
        .env_remove("OPENAI_API_KEY")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run crag");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_idempotent() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_crag(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/identity.sqlite").exists());

    let (_, _, success) = run_crag(&config_path, &["init"]);
    assert!(success, "second init failed");
}

#[test]
fn test_status_on_fresh_install() {
    let (_tmp, config_path) = setup_test_env();
    run_crag(&config_path, &["init"]);

    let (stdout, _, success) = run_crag(&config_path, &["status"]);
    assert!(success);
    assert!(stdout.contains("cli_docs"));
    assert!(stdout.contains("absent"));
    assert!(stdout.contains("Last sync:   never"));
}

#[test]
fn test_link_and_list() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) =
        run_crag(&config_path, &["link", "psid-42", "1001", "Jane Doe"]);
    assert!(success, "link failed: {}", stderr);
    assert!(stdout.contains("psid-42 -> contact 1001 (Jane Doe)"));

    let (stdout, _, success) = run_crag(&config_path, &["conversations"]);
    assert!(success);
    assert!(stdout.contains("Unlinked identities: 0"));
    assert!(stdout.contains("Linked identities: 1"));
    assert!(stdout.contains("psid-42"));

    let (stdout, _, success) = run_crag(&config_path, &["messages", "psid-42"]);
    assert!(success);
    assert!(stdout.contains("No messages for psid-42"));
}

#[test]
fn test_ingest_rejects_unsupported_file() {
    let (tmp, config_path) = setup_test_env();
    let csv = tmp.path().join("files/export.csv");

    let (_, stderr, success) =
        run_crag(&config_path, &["ingest", "files", csv.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("error: Unsupported file type '.csv'"), "{}", stderr);
}

#[test]
fn test_ingest_with_disabled_embeddings_fails_cleanly() {
    let (tmp, config_path) = setup_test_env();
    let files = tmp.path().join("files");

    let (_, stderr, success) =
        run_crag(&config_path, &["ingest", "files", files.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("disabled"), "{}", stderr);
    assert!(!stderr.contains("panicked"));
}

#[test]
fn test_ask_without_index() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_crag(&config_path, &["ask", "what is the enterprise price?"]);
    assert!(!success);
    assert!(stderr.contains("No index for collection 'cli_docs'"), "{}", stderr);

    let (_, stderr, success) = run_crag(
        &config_path,
        &["ask", "my deals?", "--identity", "psid-unknown"],
    );
    assert!(!success);
    assert!(stderr.contains("is not linked"), "{}", stderr);
}

#[test]
fn test_missing_api_key_is_reported() {
    let (tmp, config_path) = setup_test_env();
    let content = fs::read_to_string(&config_path)
        .unwrap()
        .replace(
            "provider = \"disabled\"",
            "provider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536",
        );
    fs::write(&config_path, content).unwrap();
    let files = tmp.path().join("files/pricing.md");

    let (_, stderr, success) =
        run_crag(&config_path, &["ingest", "files", files.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("OPENAI_API_KEY is not set"), "{}", stderr);
}

#[test]
fn test_completions() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_crag(&config_path, &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("crag"));
}
