#![forbid(unsafe_code)]

use engram_core::Config;
use engram_fold::{ChunkType, FoldError, build_queue, next_chunk, queue_is_empty, scan_drift};
use engram_storage::StateStore;
use std::path::{Path, PathBuf};
use std::process::Command;

fn temp_project(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("engram_pipeline_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Config pointing the session adapter at a nonexistent history file so host
/// state never leaks into tests.
fn test_config() -> Config {
    let mut config = Config::default();
    config.sources.sessions.path = "/nonexistent/engram-test-history.jsonl".to_string();
    config
}

fn write_doc(root: &Path, rel: &str, date: &str, padding: usize) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    let body = format!("# Doc\n\n**Date:** {date}\n\n{}\n", "x".repeat(padding));
    std::fs::write(path, body).expect("write doc");
}

fn open_store(root: &Path) -> StateStore {
    StateStore::open(root.join(".engram")).expect("open store")
}

#[test]
fn build_queue_filters_by_day_and_sorts() {
    let root = temp_project("queue_filter");
    let config = test_config();
    write_doc(&root, "docs/working/a.md", "2025-12-01", 10);
    write_doc(&root, "docs/working/b.md", "2026-01-01", 10);
    write_doc(&root, "docs/working/c.md", "2026-02-01", 10);

    let entries = build_queue(&config, &root, Some("2026-01-01")).expect("build queue");
    let days: Vec<&str> = entries.iter().map(|e| e.day()).collect();
    assert_eq!(days, vec!["2026-01-01", "2026-02-01"]);

    // Same-day entries survive: the filter compares days, not datetimes.
    assert!(entries.iter().any(|e| e.path.ends_with("b.md")));

    // The size inventory is unfiltered.
    let sizes: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(root.join(".engram/item_sizes.json")).expect("read sizes"),
    )
    .expect("parse sizes");
    assert_eq!(sizes.as_object().expect("map").len(), 3);

    assert!(!queue_is_empty(&root));
}

#[test]
fn datetime_start_date_is_rejected_before_any_io() {
    let root = temp_project("strict_date");
    let config = test_config();
    write_doc(&root, "docs/working/a.md", "2026-01-01", 10);

    let err = build_queue(&config, &root, Some("2026-01-01T00:00:00+00:00"))
        .expect_err("datetime must be rejected");
    assert!(matches!(err, FoldError::InvalidStartDate(_)));
    // Rejected before any side effect: no .engram directory was created.
    assert!(!root.join(".engram").exists());
}

#[test]
fn second_next_chunk_refuses_while_lock_held() {
    let root = temp_project("lock_held");
    let config = test_config();
    write_doc(&root, "docs/working/a.md", "2026-01-01", 50);
    write_doc(&root, "docs/working/b.md", "2026-01-02", 50);
    build_queue(&config, &root, None).expect("build queue");

    let mut store = open_store(&root);
    let first = next_chunk(&config, &mut store, &root, None).expect("first chunk");
    assert_eq!(first.chunk_type, ChunkType::Fold);

    let err = next_chunk(&config, &mut store, &root, None).expect_err("lock must refuse");
    assert!(matches!(err, FoldError::LockHeld { chunk_id: 1, .. }));

    // No second chunk file was produced.
    let chunk_inputs = std::fs::read_dir(root.join(".engram/chunks"))
        .expect("chunks dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with("_input.md"))
        .count();
    assert_eq!(chunk_inputs, 1);
}

#[test]
fn fold_chunk_consumes_queue_prefix_within_budget() {
    let root = temp_project("budget_prefix");
    let mut config = test_config();
    write_doc(&root, "docs/working/a.md", "2026-01-01", 100);
    write_doc(&root, "docs/working/b.md", "2026-01-02", 100);
    let entries = build_queue(&config, &root, None).expect("build queue");
    assert_eq!(entries.len(), 2);

    // Budget fits exactly one item.
    config.budget.max_chunk_chars = entries[0].chars + 10;

    let mut store = open_store(&root);
    let chunk = next_chunk(&config, &mut store, &root, None).expect("chunk");
    assert_eq!(chunk.items_count, 1);
    assert_eq!(chunk.remaining_queue, 1);
    assert_eq!(chunk.date_range.as_deref(), Some("2026-01-01 to 2026-01-01"));

    // Chronological order is preserved across dispatch boundaries: the
    // remaining entry is the later one.
    let remaining = engram_fold::queue::read_queue(&root.join(".engram/queue.jsonl"));
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].path.ends_with("b.md"));
}

#[test]
fn oversized_head_item_is_taken_alone_and_truncated() {
    let root = temp_project("oversized");
    let mut config = test_config();
    write_doc(&root, "docs/working/big.md", "2026-01-01", 5000);
    build_queue(&config, &root, None).expect("build queue");

    config.budget.max_chunk_chars = 500;

    let mut store = open_store(&root);
    let chunk = next_chunk(&config, &mut store, &root, None).expect("chunk");
    assert_eq!(chunk.items_count, 1);
    assert_eq!(chunk.chunk_chars, 500);
    assert_eq!(chunk.remaining_queue, 0);

    let input = std::fs::read_to_string(&chunk.input_path).expect("read input");
    assert!(input.contains("[TRUNCATED TO CHUNK BUDGET]"));
}

#[test]
fn fold_chunk_pre_assigns_ids_for_new_items() {
    let root = temp_project("pre_assign");
    let config = test_config();
    write_doc(&root, "docs/working/a.md", "2026-01-01", 20);
    write_doc(&root, "docs/working/b.md", "2026-01-02", 20);
    build_queue(&config, &root, None).expect("build queue");

    let mut store = open_store(&root);
    let chunk = next_chunk(&config, &mut store, &root, None).expect("chunk");
    assert_eq!(
        chunk.pre_assigned.get("C").expect("C ids"),
        &vec!["C001".to_string(), "C002".to_string()]
    );

    let input = std::fs::read_to_string(&chunk.input_path).expect("read input");
    assert!(input.contains("C001, C002"));
}

fn write_current_workflows(root: &Path, config: &Config, count: usize) {
    let doc_paths = config.doc_paths(root);
    std::fs::create_dir_all(doc_paths.workflows.parent().expect("parent")).expect("mkdir");
    let mut content = String::from("# Workflow Registry\n\n");
    for i in 1..=count {
        content.push_str(&format!(
            "## W{i:03}: Workflow number {i} (CURRENT)\n\n\
             - **Context:** repeated situation {i}\n\
             - **Trigger:** event {i}\n\n"
        ));
    }
    std::fs::write(&doc_paths.workflows, content).expect("write workflows");
}

#[test]
fn synthesis_cooldown_suppresses_reissue_until_registry_changes() {
    let root = temp_project("cooldown");
    let mut config = test_config();
    // Above the repetition threshold (default 3).
    write_current_workflows(&root, &config, 5);
    write_doc(&root, "docs/working/a.md", "2026-01-01", 50);
    write_doc(&root, "docs/working/b.md", "2026-01-02", 50);
    let entries = build_queue(&config, &root, None).expect("build queue");
    // Keep the fold chunk in the middle of this scenario to one item so the
    // queue is not drained before the cooldown lapses.
    config.budget.max_chunk_chars = entries[0].chars + 10;

    let mut store = open_store(&root);

    // Chunk 1: synthesis fires, recording the registry hash.
    let first = next_chunk(&config, &mut store, &root, None).expect("chunk 1");
    assert_eq!(first.chunk_type, ChunkType::WorkflowSynthesis);
    assert_eq!(first.items_count, 0);
    assert!(!queue_is_empty(&root), "triage chunks do not consume the queue");

    // Agent aborted without editing the registry; operator clears the lock.
    engram_fold::ActiveChunkLock::clear(&root.join(".engram")).expect("clear lock");

    // Chunk 2: same hash, within the cooldown window — falls through to fold.
    let second = next_chunk(&config, &mut store, &root, None).expect("chunk 2");
    assert_eq!(second.chunk_type, ChunkType::Fold);
    engram_fold::ActiveChunkLock::clear(&root.join(".engram")).expect("clear lock");

    // Registry edited: the hash changes and synthesis re-fires immediately.
    write_current_workflows(&root, &config, 6);
    let third = next_chunk(&config, &mut store, &root, None).expect("chunk 3");
    assert_eq!(third.chunk_type, ChunkType::WorkflowSynthesis);
    assert_eq!(third.chunk_id, 3);
}

fn git(root: &Path, args: &[&str], date: Option<&str>) {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(root)
        .env("GIT_AUTHOR_NAME", "t")
        .env("GIT_AUTHOR_EMAIL", "t@example.com")
        .env("GIT_COMMITTER_NAME", "t")
        .env("GIT_COMMITTER_EMAIL", "t@example.com");
    if let Some(date) = date {
        cmd.env("GIT_AUTHOR_DATE", date).env("GIT_COMMITTER_DATE", date);
    }
    let status = cmd.status().expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

#[test]
fn temporal_orphan_check_resolves_against_historic_commit() {
    let root = temp_project("temporal_orphans");
    let config = test_config();
    git(&root, &["init", "-q"], None);

    // The file exists in January and is deleted in February.
    std::fs::create_dir_all(root.join("src")).expect("mkdir");
    std::fs::write(root.join("src/engine.rs"), "fn main() {}").expect("write");
    git(&root, &["add", "-A"], None);
    git(&root, &["commit", "-q", "-m", "add engine"], Some("2026-01-10T12:00:00 +0000"));
    std::fs::remove_file(root.join("src/engine.rs")).expect("rm");
    git(&root, &["add", "-A"], None);
    git(&root, &["commit", "-q", "-m", "remove engine"], Some("2026-02-10T12:00:00 +0000"));

    let doc_paths = config.doc_paths(&root);
    std::fs::create_dir_all(doc_paths.concepts.parent().expect("parent")).expect("mkdir");
    std::fs::write(
        &doc_paths.concepts,
        "## C001: Engine (ACTIVE)\n\n- **Code:** src/engine.rs\n",
    )
    .expect("write concepts");

    // Steady state: the path is gone from the working tree — orphaned.
    let now_report = scan_drift(&config, &root, None);
    assert_eq!(now_report.orphaned_concepts.len(), 1);

    // Temporal mode: at 2026-01-15 the file existed — not orphaned.
    let then_report = scan_drift(&config, &root, Some("2026-01-15"));
    assert!(then_report.ref_commit.is_some());
    assert!(then_report.orphaned_concepts.is_empty());

    // Unresolvable marker (before the first commit) falls back to the
    // filesystem instead of failing the scan.
    let fallback_report = scan_drift(&config, &root, Some("2025-07-01"));
    assert!(fallback_report.ref_commit.is_none());
    assert_eq!(fallback_report.orphaned_concepts.len(), 1);
}

#[test]
fn evidence_commit_bullets_anchor_claim_age() {
    let root = temp_project("evidence_age");
    let config = test_config();
    git(&root, &["init", "-q"], None);
    std::fs::write(root.join("a.md"), "x").expect("write");
    git(&root, &["add", "-A"], None);
    git(&root, &["commit", "-q", "-m", "old evidence"], Some("2020-03-01T12:00:00 +0000"));

    let sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .current_dir(&root)
        .output()
        .expect("rev-parse");
    let sha = String::from_utf8_lossy(&sha.stdout).trim().to_string();

    let doc_paths = config.doc_paths(&root);
    std::fs::create_dir_all(doc_paths.epistemic.parent().expect("parent")).expect("mkdir");
    std::fs::write(
        &doc_paths.epistemic,
        format!(
            "## E001: Anchored claim (contested)\n\n\
             - **History:**\n- Evidence@{sha} a.md:1: disputed\n\n\
             ## E002: Unanchored claim (contested)\n\n\
             - **History:**\n- Evidence@ffffffff never resolved\n"
        ),
    )
    .expect("write epistemic");

    let report = scan_drift(&config, &root, None);
    // The resolvable sha dates the claim in 2020, far past the review window;
    // the unresolvable one contributes no timestamp and is skipped, not an
    // error.
    assert_eq!(report.contested_claims.len(), 1);
    assert_eq!(report.contested_claims[0].id.as_deref(), Some("E001"));
    assert_eq!(report.contested_claims[0].last_date, "2020-03-01");
}

#[test]
fn next_chunk_without_queue_reports_missing_then_empty() {
    let root = temp_project("queue_states");
    let config = test_config();
    let mut store = open_store(&root);

    let err = next_chunk(&config, &mut store, &root, None).expect_err("no queue yet");
    assert!(matches!(err, FoldError::QueueMissing));

    std::fs::write(root.join(".engram/queue.jsonl"), "").expect("write empty queue");
    let err = next_chunk(&config, &mut store, &root, None).expect_err("queue empty");
    assert!(matches!(err, FoldError::QueueEmpty));
    assert!(queue_is_empty(&root));
}
