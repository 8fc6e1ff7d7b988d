//! CLI test cases.
//!
//! These only cover what we can check without a recognition backend. Tests
//! that need Poppler or Tesseract installed are marked `#[ignore]`.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary, isolated from any local `.env`
/// credentials.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("searchable-pdf").unwrap();
    cmd.env_remove("ENDPOINT").env_remove("API_KEY");
    cmd
}

#[test]
fn test_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--failure-policy"))
        .stdout(predicate::str::contains("--engine"));
}

#[test]
fn test_version() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unsupported_extension() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("notes.docx");
    std::fs::write(&input, b"not a scan").unwrap();
    cmd()
        .arg(&input)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported input format"));
    assert!(!dir.path().join("notes.ocr.pdf").exists());
}

#[test]
fn test_missing_input() {
    cmd()
        .arg("does/not/exist.pdf")
        .assert()
        .failure()
        .stderr(predicate::str::contains("input file not found"));
}

#[test]
fn test_missing_azure_credentials() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("page.png");
    std::fs::write(&input, b"\x89PNG\r\n\x1a\n").unwrap();
    cmd()
        .current_dir(dir.path())
        .arg(&input)
        .args(["--engine", "azure"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ENDPOINT"));
}

#[test]
#[ignore = "Needs tesseract installed"]
fn test_tesseract_png() {
    let dir = tempfile::TempDir::new().unwrap();
    let input = dir.path().join("blank.png");
    image::RgbImage::from_pixel(200, 100, image::Rgb([255, 255, 255]))
        .save(&input)
        .unwrap();
    let report = dir.path().join("report.json");
    cmd()
        .arg(&input)
        .args(["--engine", "tesseract"])
        .arg("--report")
        .arg(&report)
        .assert()
        .success();
    assert!(dir.path().join("blank.ocr.pdf").exists());
    let report = std::fs::read_to_string(report).unwrap();
    assert!(report.contains("\"status\": \"ok\""));
}
