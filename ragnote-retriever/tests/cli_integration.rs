use anyhow::Result;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Helper to run the CLI binary with the offline mock model
fn run_cli(base_dir: &Path, args: &[&str]) -> Result<Output> {
    let output = Command::new(env!("CARGO_BIN_EXE_ragnote"))
        .arg("--base-dir")
        .arg(base_dir)
        .args(["--model", "mock"])
        .args(args)
        .env("RUST_LOG", "error") // Reduce log noise
        .output()?;
    Ok(output)
}

fn write_notes(dir: &TempDir) -> Result<()> {
    std::fs::create_dir_all(dir.path().join("pages"))?;
    std::fs::write(
        dir.path().join("pages/training.md"),
        "- DeepSpeed shards optimizer state across GPUs\n- Gradient checkpointing saves memory\n",
    )?;
    std::fs::write(
        dir.path().join("pages/garden.md"),
        "- Tomatoes need full sun\n",
    )?;
    Ok(())
}

#[test]
fn test_cli_help() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = run_cli(dir.path(), &["--help"])?;

    assert!(
        output.status.success(),
        "CLI help command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout)?;
    for command in ["index", "query", "watch", "stats"] {
        assert!(stdout.contains(command), "help is missing {command}");
    }
    Ok(())
}

#[test]
fn test_cli_index_then_query() -> Result<()> {
    let notes = tempfile::tempdir()?;
    write_notes(&notes)?;
    let notes_dir = notes.path().to_str().unwrap_or_default();

    let output = run_cli(notes.path(), &["index", notes_dir])?;
    assert!(
        output.status.success(),
        "index failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8(output.stdout)?.contains("Sent 3 blocks"));

    // A fresh process answers from the persisted records
    let output = run_cli(
        notes.path(),
        &[
            "query",
            "Gradient checkpointing saves memory",
            "-k",
            "1",
            "--format",
            "json",
        ],
    )?;
    assert!(
        output.status.success(),
        "query failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let hits: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(hits.as_array().map(Vec::len), Some(1));
    assert_eq!(hits[0]["id"], "pages/training#1");

    let output = run_cli(notes.path(), &["stats", "--format", "json"])?;
    assert!(output.status.success());
    let stats: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(stats["index_len"], 3);
    assert_eq!(stats["persistent"], true);
    Ok(())
}

#[test]
fn test_cli_invalid_input() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let output = run_cli(dir.path(), &["query", "x", "--format", "yaml"])?;
    assert!(!output.status.success(), "unknown format should fail");

    let missing = dir.path().join("does-not-exist");
    let output = run_cli(dir.path(), &["index", missing.to_str().unwrap_or_default()])?;
    assert!(!output.status.success(), "missing notes directory should fail");
    assert!(String::from_utf8_lossy(&output.stderr).contains("is not a directory"));

    let config = dir.path().join("ragnote.toml");
    std::fs::write(&config, "[index]\ncapacity = 0\n")?;
    let output = run_cli(
        dir.path(),
        &["--config", config.to_str().unwrap_or_default(), "stats"],
    )?;
    assert!(!output.status.success(), "zero capacity should be rejected");
    assert!(String::from_utf8_lossy(&output.stderr).contains("index.capacity"));
    Ok(())
}

#[test]
fn test_cli_query_empty_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = run_cli(dir.path(), &["query", "anything at all"])?;

    assert!(
        output.status.success(),
        "query on an empty store failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8(output.stdout)?.contains("Found 0 similar blocks"));
    Ok(())
}
