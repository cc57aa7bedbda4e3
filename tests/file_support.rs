//! Integration tests for non-plain-text sources: Office documents, PDFs,
//! binary files and the size limit, all driven through `docsift ingest`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docsift_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("docsift");
    path
}

/// Zip archive with one XML part, enough for the OOXML readers.
fn ooxml(part: &str, xml: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file(part, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

fn minimal_docx(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    ooxml(
        "word/document.xml",
        &format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        ),
    )
}

fn minimal_pptx(text: &str) -> Vec<u8> {
    ooxml(
        "ppt/slides/slide1.xml",
        &format!(
            "<?xml version=\"1.0\"?><p:sld xmlns:p=\"http://schemas.openxmlformats.org/presentationml/2006/main\" xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
            text
        ),
    )
}

fn setup_file_support_env(max_file_bytes: u64) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::create_dir_all(root.join("config")).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    let docs = root.join("docs");
    fs::create_dir_all(&docs).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/docsift.sqlite"

[embedding]
provider = "hash"
dims = 128

[ingest]
documents_root = "{root}/docs"
max_file_bytes = {max}
"#,
        root = root.display(),
        max = max_file_bytes
    );
    fs::write(root.join("config").join("docsift.toml"), config_content).unwrap();

    fs::write(docs.join("readme.md"), "# Readme\n\nPlain text file for tests.\n").unwrap();

    (tmp, root.join("config").join("docsift.toml"))
}

fn run_docsift(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docsift_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docsift: {}", e));
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn ingest(config_path: &Path) -> String {
    let (stdout, stderr, success) = run_docsift(config_path, &["ingest", "--progress", "off"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

#[test]
fn docx_is_ingested_and_searchable() {
    let (tmp, config_path) = setup_file_support_env(1024 * 1024);
    fs::write(
        tmp.path().join("docs").join("handbook.docx"),
        minimal_docx(&["office test phrase", "second paragraph about onboarding"]),
    )
    .unwrap();

    let stdout = ingest(&config_path);
    assert!(stdout.contains("indexed: 2"), "{}", stdout);

    let (search_out, _, success) = run_docsift(&config_path, &["search", "office test phrase"]);
    assert!(success);
    let first = search_out.lines().next().unwrap_or_default();
    assert!(first.contains("handbook.docx"), "got: {}", search_out);

    let (get_out, _, success) = run_docsift(&config_path, &["get", "handbook.docx", "--json"]);
    assert!(success);
    let source: serde_json::Value = serde_json::from_str(&get_out).unwrap();
    assert_eq!(
        source["text"],
        "office test phrase\nsecond paragraph about onboarding\n"
    );
}

#[test]
fn pptx_slide_text_is_ingested() {
    let (tmp, config_path) = setup_file_support_env(1024 * 1024);
    fs::write(
        tmp.path().join("docs").join("roadmap.pptx"),
        minimal_pptx("quarterly roadmap milestones"),
    )
    .unwrap();

    ingest(&config_path);
    let (search_out, _, _) = run_docsift(&config_path, &["search", "roadmap milestones"]);
    assert!(
        search_out.lines().next().unwrap_or_default().contains("roadmap.pptx"),
        "{}",
        search_out
    );
}

#[test]
fn office_sources_are_unchanged_on_reingest() {
    let (tmp, config_path) = setup_file_support_env(1024 * 1024);
    fs::write(
        tmp.path().join("docs").join("handbook.docx"),
        minimal_docx(&["stable content"]),
    )
    .unwrap();

    ingest(&config_path);
    let stdout = ingest(&config_path);
    assert!(stdout.contains("unchanged: 2"), "{}", stdout);
    assert!(stdout.contains("indexed: 0"), "{}", stdout);
}

#[test]
fn corrupt_pdf_fails_alone() {
    let (tmp, config_path) = setup_file_support_env(1024 * 1024);
    let docs = tmp.path().join("docs");
    fs::write(docs.join("bad.pdf"), b"not a valid pdf").unwrap();
    fs::write(docs.join("good.md"), "# Good\n\nThis is good.\n").unwrap();

    let stdout = ingest(&config_path);
    assert!(stdout.contains("indexed: 2"), "{}", stdout);
    assert!(stdout.contains("failed: 1"), "{}", stdout);
    assert!(stdout.contains("bad.pdf"), "{}", stdout);
    assert!(stdout.trim_end().ends_with("completed with failures"));
}

#[test]
fn binary_and_oversized_files_are_skipped() {
    let (tmp, config_path) = setup_file_support_env(1000);
    let docs = tmp.path().join("docs");
    fs::write(docs.join("blob.dat"), [0u8, 159, 146, 150, 0, 1]).unwrap();
    fs::write(docs.join("big.md"), "word ".repeat(400)).unwrap();
    fs::write(docs.join("small.md"), "# Small\n\nOk.\n").unwrap();

    let stdout = ingest(&config_path);
    assert!(stdout.contains("indexed: 2"), "{}", stdout);
    assert!(stdout.contains("skipped: 2"), "{}", stdout);
    assert!(stdout.contains("big.md  (2000 bytes exceeds limit of 1000)"), "{}", stdout);
    assert!(stdout.contains("blob.dat  (binary content)"), "{}", stdout);
    assert!(stdout.trim_end().ends_with("ok"));
}
