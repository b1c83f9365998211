use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docflow_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docflow");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("nested")).unwrap();
    fs::write(files_dir.join("notes.txt"), "Quarterly notes.\n\nRevenue grew.").unwrap();
    fs::write(files_dir.join("nested/readme.md"), "# Readme\n\nHello.").unwrap();
    fs::write(files_dir.join("archive.zip"), b"PK\x03\x04").unwrap();

    // Jitter and dispatch delays off so runs stay fast.
    let config_content = format!(
        r#"[db]
path = "{root}/data/docflow.sqlite"

[storage]
root = "{root}/blobs"

[dispatch]
jitter_min_ms = 0
jitter_max_ms = 0

[retry]
max_seconds_hide_on_upload = 1

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docflow.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docflow(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docflow_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docflow binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docflow(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(stdout.contains("Seeded default prompt"));

    let (stdout, _, success) = run_docflow(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
    assert!(!stdout.contains("Seeded default prompt"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_docflow(&tmp.path().join("nope.toml"), &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_upload_dispatches_supported_files() {
    let (tmp, config_path) = setup_test_env();
    run_docflow(&config_path, &["init"]);

    let files = tmp.path().join("files");
    let (stdout, stderr, success) =
        run_docflow(&config_path, &["upload", files.to_str().unwrap()]);
    assert!(success, "upload failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("skipped    upload/archive.zip"));
    assert!(stdout.contains("queued     upload/nested/readme.md  -> non-pdf-submit-queue"));
    assert!(stdout.contains("queued     upload/notes.txt  -> non-pdf-submit-queue"));

    assert!(tmp.path().join("blobs/upload/notes.txt").exists());
}

#[test]
fn test_status_after_upload() {
    let (tmp, config_path) = setup_test_env();
    run_docflow(&config_path, &["init"]);

    let files = tmp.path().join("files");
    run_docflow(&config_path, &["upload", files.to_str().unwrap()]);

    let (stdout, stderr, success) =
        run_docflow(&config_path, &["status", "get", "upload/notes.txt"]);
    assert!(success, "status get failed: {}", stderr);
    assert!(stdout.contains("state:         Queued"), "got: {}", stdout);

    let (stdout, _, success) =
        run_docflow(&config_path, &["status", "get", "upload/archive.zip", "--json"]);
    assert!(success);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["state"], "Skipped");

    let (stdout, _, success) = run_docflow(
        &config_path,
        &["status", "list", "--within-hours", "-1", "--state", "Queued"],
    );
    assert!(success);
    assert!(stdout.contains("upload/notes.txt"));
    assert!(!stdout.contains("upload/archive.zip"));

    let (_, stderr, success) =
        run_docflow(&config_path, &["status", "get", "upload/missing.pdf"]);
    assert!(!success);
    assert!(stderr.contains("no status recorded"));

    let (_, stderr, success) =
        run_docflow(&config_path, &["status", "list", "--state", "Finished"]);
    assert!(!success);
    assert!(stderr.contains("expected one of"));
}

#[test]
fn test_stats_reports_queue_depths() {
    let (tmp, config_path) = setup_test_env();
    run_docflow(&config_path, &["init"]);

    let notes = tmp.path().join("files/notes.txt");
    run_docflow(&config_path, &["upload", notes.to_str().unwrap()]);

    let (stdout, stderr, success) = run_docflow(&config_path, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Documents:   1"));
    let line = stdout
        .lines()
        .find(|l| l.trim_start().starts_with("non-pdf-submit-queue "))
        .unwrap();
    assert!(line.trim_end().ends_with('1'), "got: {}", line);
    assert!(stdout.contains("chunks-queue-poison"));
}

#[test]
fn test_prompts_get_and_set() {
    let (_tmp, config_path) = setup_test_env();
    run_docflow(&config_path, &["init"]);

    let (stdout, _, success) = run_docflow(&config_path, &["prompts", "get"]);
    assert!(success);
    assert!(!stdout.trim().is_empty());

    let (_, _, success) = run_docflow(
        &config_path,
        &["prompts", "get", "--user", "alice", "--id", "summary"],
    );
    assert!(!success);

    let (stdout, stderr, success) = run_docflow(
        &config_path,
        &[
            "prompts",
            "set",
            "--user",
            "alice",
            "--id",
            "summary",
            "Summarize the text.",
        ],
    );
    assert!(success, "prompts set failed: {}", stderr);
    assert!(stdout.contains("Saved prompt"));

    let (stdout, _, success) = run_docflow(
        &config_path,
        &["prompts", "get", "--user", "alice", "--id", "summary"],
    );
    assert!(success);
    assert_eq!(stdout.trim(), "Summarize the text.");
}
