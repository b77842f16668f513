//! End-to-end scenarios against the library API.
//!
//! Every test uses the hashing embedding provider so no model download or
//! network access is needed, and a fresh temporary knowledge-base directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kb_rag::config::{Config, ProviderKind};
use kb_rag::handler::{CancelFlag, IngestStatus, KbState, RagHandler};
use kb_rag::search::SearchOptions;
use tempfile::TempDir;

fn hashing_config(kb: &Path, dims: usize) -> Config {
    let mut cfg = Config::default();
    cfg.knowledge_base.path = kb.to_path_buf();
    cfg.embedding.provider = ProviderKind::Hashing;
    cfg.embedding.dims = Some(dims);
    cfg.embedding.fallback_model = None;
    cfg
}

fn setup() -> (TempDir, PathBuf, RagHandler) {
    let tmp = TempDir::new().unwrap();
    let kb = tmp.path().join("kb");
    let handler = RagHandler::open(hashing_config(&kb, 64)).unwrap();
    (tmp, kb, handler)
}

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn top_k(handler: &RagHandler, query: &str, n: usize) -> Vec<kb_rag::RetrievedChunk> {
    let mut opts = SearchOptions::from_config(&handler.config().retrieval);
    opts.n_results = n;
    handler.get_relevant_chunks(query, &opts)
}

#[test]
fn test_text_file_is_found_by_query() {
    let (tmp, _kb, handler) = setup();
    let fox = write(tmp.path(), "fox.txt", "The quick brown fox jumps over the lazy dog.");
    let revenue = write(
        tmp.path(),
        "revenue.txt",
        "Quarterly revenue grew by twelve percent in the third quarter.",
    );

    assert!(handler.add_file(&fox, None).is_success());
    assert!(handler.add_file(&revenue, None).is_success());
    assert_eq!(handler.get_indexed_files(), vec!["fox.txt", "revenue.txt"]);

    let results = top_k(&handler, "brown fox", 1);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].metadata.file_name, "fox.txt");
    assert!(results[0].content.contains("brown fox"));
}

#[test]
fn test_csv_rows_are_searchable() {
    let (tmp, _kb, handler) = setup();
    let csv = write(tmp.path(), "people.csv", "name,age\nAlice,30\nBob,25\n");

    let outcome = handler.add_file(&csv, None);
    match outcome.status {
        IngestStatus::Indexed { chunks, replaced } => {
            // one table chunk plus one chunk per row
            assert_eq!(chunks, 3);
            assert_eq!(replaced, 0);
        }
        other => panic!("unexpected status {:?}", other),
    }

    let results = top_k(&handler, "Bob", 3);
    assert!(!results.is_empty());
    assert!(results[0].content.contains("Bob"));
    assert!(results.iter().all(|r| r.metadata.is_table));
    assert!(results
        .iter()
        .any(|r| r.metadata.row_index == Some(2) && r.content.contains("age: 25")));
}

#[test]
fn test_unchanged_file_is_skipped() {
    let (tmp, _kb, handler) = setup();
    let file = write(tmp.path(), "notes.md", "# Notes\n\nMeeting notes about the release plan.");

    assert!(matches!(
        handler.add_file(&file, None).status,
        IngestStatus::Indexed { .. }
    ));
    let before = handler.chunk_count();
    let again = handler.add_file(&file, None);
    assert_eq!(again.status, IngestStatus::Unchanged);
    assert_eq!(handler.chunk_count(), before);
}

#[test]
fn test_modified_file_replaces_chunks_and_records_lineage() {
    let (tmp, _kb, handler) = setup();
    let file = write(tmp.path(), "plan.txt", "Version one of the migration plan.");
    handler.add_file(&file, None);
    let first_hash = handler.get_indexed_files_detailed()[0].entry.hash.clone();

    write(tmp.path(), "plan.txt", "Version two of the migration plan, now with rollback steps.");
    let outcome = handler.add_file(&file, None);
    assert_eq!(
        outcome.status,
        IngestStatus::Indexed {
            chunks: 1,
            replaced: 1
        }
    );

    let chunks = handler.chunks();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].0.contains("rollback"));
    assert_eq!(chunks[0].1.version_lineage, vec![first_hash.clone()]);

    let detailed = handler.get_indexed_files_detailed();
    assert_eq!(detailed[0].entry.version_count, 2);
    assert_eq!(detailed[0].entry.previous_hashes, vec![first_hash]);
}

#[test]
fn test_remove_file_drops_its_chunks() {
    let (tmp, _kb, handler) = setup();
    let a = write(tmp.path(), "a.txt", "Alpha document about solar panels.");
    let b = write(tmp.path(), "b.txt", "Beta document about wind turbines.");
    handler.add_file(&a, None);
    handler.add_file(&b, None);
    assert_eq!(handler.chunk_count(), 2);

    assert!(handler.remove_file("a.txt"));
    assert_eq!(handler.chunk_count(), 1);
    assert_eq!(handler.get_indexed_files(), vec!["b.txt"]);
    assert!(top_k(&handler, "solar panels", 5)
        .iter()
        .all(|r| r.metadata.file_name != "a.txt"));

    assert!(!handler.remove_file("a.txt"));
}

#[test]
fn test_empty_knowledge_base_returns_nothing() {
    let (_tmp, _kb, handler) = setup();
    assert_eq!(handler.state(), KbState::Empty);
    assert!(handler.search("anything at all").is_empty());
    assert!(handler.search("   ").is_empty());
}

#[test]
fn test_state_survives_reopen() {
    let (tmp, kb, handler) = setup();
    let file = write(tmp.path(), "doc.txt", "Persistent knowledge about glaciers and ice sheets.");
    handler.add_file(&file, None);
    assert_eq!(handler.state(), KbState::Persisted);
    drop(handler);

    for name in ["vectors.index", "metadata.json", "file_registry.json", "embeddings_cache.json"] {
        assert!(kb.join(name).exists(), "{} missing", name);
    }

    let reopened = RagHandler::open(hashing_config(&kb, 64)).unwrap();
    assert_eq!(reopened.state(), KbState::Loaded);
    assert_eq!(reopened.get_indexed_files(), vec!["doc.txt"]);
    let results = top_k(&reopened, "glaciers", 1);
    assert_eq!(results[0].metadata.file_name, "doc.txt");
}

#[test]
fn test_embedding_dimension_change_clears_index() {
    let (tmp, kb, handler) = setup();
    let file = write(tmp.path(), "doc.txt", "Content embedded with sixty-four dimensions.");
    handler.add_file(&file, None);
    drop(handler);

    let reopened = RagHandler::open(hashing_config(&kb, 32)).unwrap();
    assert_eq!(reopened.state(), KbState::NeedsReindex);
    assert_eq!(reopened.chunk_count(), 0);
    assert!(reopened.get_indexed_files().is_empty());
    assert!(kb.join("backup").is_dir());

    assert!(reopened.add_file(&file, None).is_success());
    assert_eq!(reopened.get_stats().dims, 32);
}

#[test]
fn test_unknown_local_model_falls_back_to_hashing() {
    let tmp = TempDir::new().unwrap();
    let mut cfg = hashing_config(&tmp.path().join("kb"), 48);
    cfg.embedding.provider = ProviderKind::Local;
    cfg.embedding.model = Some("no-such-model".into());

    let handler = RagHandler::open(cfg).unwrap();
    let stats = handler.get_stats();
    assert_eq!(stats.embedding_provider, "hashing");
    assert_eq!(stats.dims, 48);
    assert!(!stats.zero_vector_mode);

    let file = write(tmp.path(), "a.txt", "Fallback embeddings still index this text.");
    assert!(handler.add_file(&file, None).is_success());
}

#[test]
fn test_clear_knowledge_base_keeps_cache() {
    let (tmp, kb, handler) = setup();
    let file = write(tmp.path(), "a.txt", "Something worth caching for later.");
    handler.add_file(&file, None);
    assert!(handler.get_stats().cache_entries > 0);

    assert!(handler.clear_knowledge_base());
    assert_eq!(handler.state(), KbState::Empty);
    assert_eq!(handler.chunk_count(), 0);
    assert!(!kb.join("vectors.index").exists());
    assert!(handler.get_stats().cache_entries > 0);
}

#[test]
fn test_set_knowledge_base_path_switches_directories() {
    let (tmp, _kb, handler) = setup();
    let file = write(tmp.path(), "a.txt", "Lives in the first knowledge base.");
    handler.add_file(&file, None);

    let other = tmp.path().join("other-kb");
    handler.set_knowledge_base_path(&other).unwrap();
    assert_eq!(handler.knowledge_base_path(), other);
    assert_eq!(handler.state(), KbState::Empty);
    assert!(handler.get_indexed_files().is_empty());
}

#[test]
fn test_repair_registry_restores_missing_entries() {
    let (tmp, kb, handler) = setup();
    let file = write(tmp.path(), "a.txt", "Registry repair should find this file again.");
    handler.add_file(&file, None);
    drop(handler);

    fs::write(kb.join("file_registry.json"), "{}").unwrap();
    let reopened = RagHandler::open(hashing_config(&kb, 64)).unwrap();
    // load already reconciles the registry with chunk metadata
    assert_eq!(reopened.get_indexed_files(), vec!["a.txt"]);
    assert!(reopened.repair_registry().is_clean());
}

#[test]
fn test_safe_mode_limits_results() {
    let (tmp, _kb, handler) = setup();
    for i in 0..6 {
        let f = write(
            tmp.path(),
            &format!("f{}.txt", i),
            &format!("Document number {} discusses shared infrastructure costs in detail.", i),
        );
        handler.add_file(&f, None);
    }
    assert_eq!(top_k(&handler, "infrastructure costs", 4).len(), 4);
    handler.set_safe_mode(true);
    assert_eq!(top_k(&handler, "infrastructure costs", 4).len(), 2);
}

#[test]
fn test_progress_is_reported() {
    let (tmp, _kb, handler) = setup();
    let file = write(tmp.path(), "a.txt", "Progress callbacks fire during ingestion.");
    let seen = Mutex::new(Vec::new());
    let cb = |msg: &str, pct: u8| seen.lock().unwrap().push((msg.to_string(), pct));
    handler.add_file(&file, Some(&cb));
    let seen = seen.into_inner().unwrap();
    assert!(seen.len() >= 3);
    assert_eq!(seen.last().unwrap().1, 100);
    assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_add_preserves_input_order() {
    let (tmp, _kb, handler) = setup();
    let handler = Arc::new(handler);
    let paths: Vec<PathBuf> = (0..5)
        .map(|i| {
            write(
                tmp.path(),
                &format!("doc{}.txt", i),
                &format!("Batch document {} about topic {}.", i, i * 7),
            )
        })
        .chain(std::iter::once(tmp.path().join("missing.txt")))
        .collect();

    let outcomes = handler
        .batch_add_files(paths.clone(), None, &CancelFlag::new())
        .await;
    assert_eq!(outcomes.len(), 6);
    for (i, o) in outcomes.iter().take(5).enumerate() {
        assert_eq!(o.file_name, format!("doc{}.txt", i));
        assert!(o.is_success());
    }
    assert!(matches!(outcomes[5].status, IngestStatus::Failed { .. }));
    assert_eq!(handler.get_indexed_files().len(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_batch_skips_files() {
    let (tmp, _kb, handler) = setup();
    let handler = Arc::new(handler);
    let paths: Vec<PathBuf> = (0..3)
        .map(|i| write(tmp.path(), &format!("c{}.txt", i), "Never ingested."))
        .collect();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let outcomes = handler.batch_add_files(paths, None, &cancel).await;
    assert!(outcomes.iter().all(|o| o.status == IngestStatus::Cancelled));
    assert!(handler.get_indexed_files().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_add_directory_applies_globs() {
    let (tmp, _kb, handler) = setup();
    let handler = Arc::new(handler);
    let docs = tmp.path().join("docs");
    fs::create_dir_all(docs.join("nested")).unwrap();
    write(&docs, "a.md", "# A\n\nMarkdown at the top level.");
    write(&docs.join("nested"), "b.txt", "Plain text in a nested folder.");
    write(&docs, "image.png", "not an image");

    let outcomes = handler
        .add_directory(&docs, None, &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.is_success()));
    assert_eq!(handler.get_indexed_files(), vec!["a.md", "b.txt"]);
}
