use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn documind_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("documind");
    path
}

fn setup_test_env(config: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("documind.toml");
    fs::write(&config_path, config).unwrap();
    fs::write(
        tmp.path().join("guide.md"),
        "# Guide\n\nInstall the tool, then run it.\n",
    )
    .unwrap();
    (tmp, config_path)
}

fn run_documind(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = documind_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("GEMINI_API_KEY")
        .env_remove("DOCUMIND_ENV")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run documind binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_models_lists_builtin_and_configured_models() {
    let (_tmp, config) = setup_test_env(
        "[models.house-llm]\ntoken_budget = 32000\n",
    );
    let (stdout, stderr, ok) = run_documind(&config, &["models"]);
    assert!(ok, "models failed: {}", stderr);
    assert!(stdout.contains("gpt-4"));
    assert!(stdout.contains("8192"));
    assert!(stdout.contains("house-llm"));
    assert!(stdout.contains("32000"));
    assert!(stdout.contains("(default)"));
}

#[test]
fn test_models_works_without_api_key() {
    let (_tmp, config) = setup_test_env("");
    let (_, stderr, ok) = run_documind(&config, &["models"]);
    assert!(ok, "models should not need a key: {}", stderr);
}

#[test]
fn test_process_requires_api_key() {
    let (tmp, config) = setup_test_env("");
    let input = tmp.path().join("guide.md");
    let (_, stderr, ok) = run_documind(&config, &["process", input.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("GEMINI_API_KEY"), "stderr: {}", stderr);
}

#[test]
fn test_process_rejects_unsupported_file_type() {
    let (tmp, config) = setup_test_env("[inference]\napi_key = \"test-key-0123456789\"\n");
    let input = tmp.path().join("archive.tar");
    fs::write(&input, b"not a document").unwrap();
    let (_, stderr, ok) = run_documind(&config, &["process", input.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("unsupported file type"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_is_reported() {
    let (_tmp, config) = setup_test_env("[rate_limit]\npoints = 0\n");
    let (_, stderr, ok) = run_documind(&config, &["models"]);
    assert!(!ok);
    assert!(stderr.contains("rate_limit.points"), "stderr: {}", stderr);
}
