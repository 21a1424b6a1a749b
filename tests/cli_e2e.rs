//! End-to-end CLI tests for the file-downloader binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::{socket_skip_return, start_mock_server_or_skip};

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return socket_skip_return();
        };
        mock_server
    }};
}

/// Binary with an empty config home so a developer's own config never leaks in.
fn isolated_cmd(config_home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("file-downloader").unwrap();
    cmd.env("XDG_CONFIG_HOME", config_home.path())
        .env_remove("RUST_LOG");
    cmd
}

/// Test that the binary exits cleanly when no URLs are given.
#[test]
fn test_binary_without_input_returns_zero() {
    let config_home = TempDir::new().unwrap();
    isolated_cmd(&config_home).assert().success();
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    let config_home = TempDir::new().unwrap();
    isolated_cmd(&config_home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Resumable, prioritized HTTP downloads"))
        .stdout(predicate::str::contains("--output-dir"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    let config_home = TempDir::new().unwrap();
    isolated_cmd(&config_home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("file-downloader"));
}

/// Test that invalid flags cause non-zero exit.
#[test]
fn test_binary_invalid_flag_returns_error() {
    let config_home = TempDir::new().unwrap();
    isolated_cmd(&config_home)
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

/// Test that a malformed config file is reported, not silently ignored.
#[test]
fn test_binary_rejects_invalid_config_file() {
    let config_home = TempDir::new().unwrap();
    let config_dir = config_home.path().join("file-downloader");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(config_dir.join("config.toml"), "concurrency = 4\n").unwrap();

    isolated_cmd(&config_home)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_downloads_urls_into_output_dir() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/pub/report%20v2.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.7 report".to_vec()))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pub/notes.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("notes"))
        .mount(&mock_server)
        .await;

    let config_home = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    isolated_cmd(&config_home)
        .arg("-q")
        .arg("-o")
        .arg(out.path())
        .arg(format!("{}/pub/report%20v2.pdf", mock_server.uri()))
        .arg(format!("{}/pub/notes.txt", mock_server.uri()))
        .assert()
        .success();

    assert_eq!(
        std::fs::read(out.path().join("report v2.pdf")).unwrap(),
        b"%PDF-1.7 report"
    );
    assert_eq!(
        std::fs::read_to_string(out.path().join("notes.txt")).unwrap(),
        "notes"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_reads_urls_from_stdin_and_config_output_dir() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_string("from stdin"))
        .mount(&mock_server)
        .await;

    let config_home = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let target = out.path().join("mirror");
    let config_dir = config_home.path().join("file-downloader");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.toml"),
        format!("output_dir = \"{}\"\nworkers = 2\n", target.display()),
    )
    .unwrap();

    isolated_cmd(&config_home)
        .arg("-q")
        .write_stdin(format!("# list\n{}/a.bin\n", mock_server.uri()))
        .assert()
        .success();

    assert_eq!(
        std::fs::read_to_string(target.join("a.bin")).unwrap(),
        "from stdin"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_binary_exits_non_zero_when_a_download_fails() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/ok.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let config_home = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    isolated_cmd(&config_home)
        .arg("-q")
        .arg("--output-dir")
        .arg(out.path())
        .arg(format!("{}/ok.txt", mock_server.uri()))
        .arg(format!("{}/gone.txt", mock_server.uri()))
        .assert()
        .failure()
        .stderr(predicate::str::contains("1 of 2 downloads failed"));

    assert!(out.path().join("ok.txt").exists());
    assert!(!out.path().join("gone.txt").exists());
    assert!(!out.path().join("gone.txt.part").exists());
}
