//! CLI tests for multi-format ingestion through the `kb` binary.
//!
//! Covers DOCX and HTML ingest plus search, idempotent re-add, failures that
//! leave other files indexed, the file size limit, and the JSON outputs of
//! `list` and `stats`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kb_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("kb");
    path
}

fn minimal_docx_with_text(phrase: &str) -> Vec<u8> {
    use std::io::Write;
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        );
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

/// Temp root with `config/kb.toml` (hashing embeddings, 1 KB size limit) and
/// a `files/` directory holding `readme.md`.
fn setup_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    fs::create_dir_all(root.join("config")).unwrap();
    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();

    let config_content = format!(
        r#"[knowledge_base]
path = "{}"

[embedding]
provider = "hashing"
dims = 64

[ingestion]
max_file_bytes = 1000
max_workers = 2
"#,
        root.join("kb").display().to_string().replace('\\', "/")
    );
    fs::write(root.join("config").join("kb.toml"), config_content).unwrap();
    fs::write(
        files_dir.join("readme.md"),
        "# Readme\n\nPlain text file for tests.\n",
    )
    .unwrap();

    (tmp, root.join("config").join("kb.toml"))
}

fn run_kb(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kb_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kb at {:?}: {}", binary, e));
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files_dir(tmp: &TempDir) -> PathBuf {
    tmp.path().join("files")
}

#[test]
fn docx_ingest_and_search() {
    let (tmp, config) = setup_env();
    let docx = files_dir(&tmp).join("guide.docx");
    fs::write(&docx, minimal_docx_with_text("office test phrase")).unwrap();

    let (stdout, stderr, ok) = run_kb(&config, &["add", docx.to_str().unwrap()]);
    assert!(ok, "add failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("added     guide.docx"), "{}", stdout);

    let (out, _, ok) = run_kb(&config, &["search", "office test phrase"]);
    assert!(ok);
    assert!(out.contains("guide.docx"), "{}", out);
    assert!(out.contains("office test phrase"), "{}", out);
}

#[test]
fn html_ingest_and_search() {
    let (tmp, config) = setup_env();
    let html = files_dir(&tmp).join("page.html");
    fs::write(
        &html,
        "<html><head><script>var x = 1;</script></head><body><h1>Deploy</h1><p>Rolling deployment guide.</p></body></html>",
    )
    .unwrap();

    let (_, stderr, ok) = run_kb(&config, &["add", html.to_str().unwrap()]);
    assert!(ok, "{}", stderr);
    let (out, _, _) = run_kb(&config, &["search", "rolling deployment", "--json"]);
    let results: serde_json::Value = serde_json::from_str(&out).unwrap();
    let first = &results[0];
    assert_eq!(first["metadata"]["file_name"], "page.html");
    assert_eq!(first["metadata"]["source_type"], "html");
    assert!(!first["content"].as_str().unwrap().contains("var x"));
}

#[test]
fn readd_is_idempotent() {
    let (tmp, config) = setup_env();
    let readme = files_dir(&tmp).join("readme.md");
    let path = readme.to_str().unwrap();

    let (first, _, ok) = run_kb(&config, &["add", path]);
    assert!(ok);
    assert!(first.contains("added     readme.md"), "{}", first);
    let (second, _, ok) = run_kb(&config, &["add", path]);
    assert!(ok);
    assert!(second.contains("unchanged readme.md"), "{}", second);

    let (list, _, _) = run_kb(&config, &["list", "--json"]);
    let files: serde_json::Value = serde_json::from_str(&list).unwrap();
    assert_eq!(files.as_array().unwrap().len(), 1);
    assert_eq!(files[0]["version_count"], 1);
}

#[test]
fn corrupt_file_fails_but_others_are_indexed() {
    let (tmp, config) = setup_env();
    fs::write(files_dir(&tmp).join("bad.pdf"), b"not a valid pdf").unwrap();
    fs::write(files_dir(&tmp).join("good.md"), "# Good\n\nThis is good.\n").unwrap();

    let (stdout, stderr, ok) = run_kb(&config, &["add-dir", files_dir(&tmp).to_str().unwrap()]);
    assert!(!ok, "a failed file makes the command fail");
    assert!(stdout.contains("failed") && stdout.contains("bad.pdf"), "{}", stdout);
    assert!(stderr.contains("1 of 3 files failed"), "{}", stderr);

    let (list, _, _) = run_kb(&config, &["list"]);
    assert!(list.contains("good.md"), "{}", list);
    assert!(list.contains("readme.md"), "{}", list);
    assert!(!list.contains("bad.pdf"), "{}", list);
}

#[test]
fn oversized_file_is_skipped() {
    let (tmp, config) = setup_env();
    let big = files_dir(&tmp).join("big.txt");
    fs::write(&big, "word ".repeat(400)).unwrap();

    let (stdout, _, ok) = run_kb(&config, &["add", big.to_str().unwrap()]);
    assert!(!ok);
    assert!(stdout.contains("limit is 1000"), "{}", stdout);
    let (list, _, _) = run_kb(&config, &["list"]);
    assert!(list.contains("No files indexed."), "{}", list);
}

#[test]
fn remove_and_stats() {
    let (tmp, config) = setup_env();
    let readme = files_dir(&tmp).join("readme.md");
    run_kb(&config, &["add", readme.to_str().unwrap()]);

    let (stats, _, ok) = run_kb(&config, &["stats", "--json"]);
    assert!(ok);
    let v: serde_json::Value = serde_json::from_str(&stats).unwrap();
    assert_eq!(v["total_files"], 1);
    assert_eq!(v["embedding_provider"], "hashing");
    assert_eq!(v["dims"], 64);

    let (out, _, ok) = run_kb(&config, &["remove", "readme.md"]);
    assert!(ok, "{}", out);
    let (_, stderr, ok) = run_kb(&config, &["remove", "readme.md"]);
    assert!(!ok);
    assert!(stderr.contains("not in the knowledge base"), "{}", stderr);

    let (repair, _, ok) = run_kb(&config, &["repair"]);
    assert!(ok);
    assert!(repair.contains("Registry is consistent."), "{}", repair);
}

#[test]
fn clear_requires_confirmation() {
    let (tmp, config) = setup_env();
    let readme = files_dir(&tmp).join("readme.md");
    run_kb(&config, &["add", readme.to_str().unwrap()]);

    let (_, _, ok) = run_kb(&config, &["clear"]);
    assert!(!ok);
    let (out, _, ok) = run_kb(&config, &["clear", "--yes"]);
    assert!(ok, "{}", out);
    let (list, _, _) = run_kb(&config, &["list"]);
    assert!(list.contains("No files indexed."), "{}", list);
}
