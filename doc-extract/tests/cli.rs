use std::process::Command;

use doc_extract::Document;

#[test]
fn cli_prints_markdown_document() {
    let output = Command::new(env!("CARGO_BIN_EXE_doc_extract"))
        .arg("tests/fixtures/notes/ownership.md")
        .output()
        .expect("run CLI");

    assert!(
        output.status.success(),
        "cli exited with {}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    let documents: Vec<Document> =
        serde_json::from_slice(&output.stdout).expect("valid JSON output");
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].display_name, "ownership");
    assert_eq!(documents[0].links, vec!["borrowing", "moves"]);
}

#[test]
fn cli_rejects_unknown_extension() {
    let output = Command::new(env!("CARGO_BIN_EXE_doc_extract"))
        .arg("tests/fixtures/notes/data.csv")
        .output()
        .expect("run CLI");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unsupported file extension"));
}

#[test]
fn cli_concatenates_files_in_argument_order() {
    let output = Command::new(env!("CARGO_BIN_EXE_doc_extract"))
        .args([
            "tests/fixtures/notes/nested/lifetimes.txt",
            "tests/fixtures/notes/ownership.md",
        ])
        .output()
        .expect("run CLI");
    assert!(output.status.success());

    let documents: Vec<Document> =
        serde_json::from_slice(&output.stdout).expect("valid JSON output");
    let names: Vec<&str> = documents
        .iter()
        .map(|doc| doc.display_name.as_str())
        .collect();
    assert_eq!(names, vec!["lifetimes", "ownership"]);
}

#[test]
fn cli_summary_prints_counts() {
    let output = Command::new(env!("CARGO_BIN_EXE_doc_extract"))
        .args(["--summary", "tests/fixtures/notes/nested/lifetimes.txt"])
        .output()
        .expect("run CLI");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        "tests/fixtures/notes/nested/lifetimes.txt: 1 documents, 24 words"
    );
}

#[test]
fn cli_without_files_prints_usage() {
    let output = Command::new(env!("CARGO_BIN_EXE_doc_extract"))
        .output()
        .expect("run CLI");
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage:"));
}
