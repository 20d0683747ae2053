#![forbid(unsafe_code)]

//! Chunk assembly with drift-priority scheduling.
//!
//! `next_chunk` is the scheduler: it refuses while an active chunk exists,
//! computes the character budget, evaluates drift thresholds in priority
//! order (with the synthesis cooldown filter), and assembles either a triage
//! chunk or a chronological fold chunk from the head of the queue. Chunk
//! artifacts are written before the active-chunk lock, so a crash between
//! the two can only leave orphaned files, never a lock without files.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::drift::{DriftReport, scan_drift, workflow_registry_hash};
use crate::ids::{PreAssigned, estimate_new_entities, pre_assign};
use crate::lock::{ActiveChunkLock, auto_clear_if_processed};
use crate::manifest::{
    ManifestEntry, append_manifest, manifest_path, next_chunk_id, read_manifest,
    synthesis_on_cooldown,
};
use crate::prompt::{render_agent_prompt, render_chunk_input, render_triage_input};
use crate::queue::{QUEUE_FILE, QueueEntry, read_queue, write_queue};
use crate::sources::render_issue_markdown;
use crate::{ChunkType, FoldError, engram_dir};
use engram_core::dates::now_rfc3339;
use engram_core::{Config, DocPaths};
use engram_storage::StateStore;

/// Output of `next_chunk` for dispatch and CLI reporting.
#[derive(Clone, Debug)]
pub struct ChunkResult {
    pub chunk_id: i64,
    pub chunk_type: ChunkType,
    pub input_path: PathBuf,
    pub prompt_path: PathBuf,
    pub items_count: usize,
    pub chunk_chars: usize,
    pub budget: usize,
    pub living_docs_chars: usize,
    pub remaining_queue: usize,
    pub date_range: Option<String>,
    pub drift_entry_count: usize,
    pub pre_assigned: PreAssigned,
}

/// Available char budget for chunk content: the context limit minus measured
/// living docs and instruction overhead, capped by `max_chunk_chars`.
/// Returns `(budget, living_docs_chars)`.
pub fn compute_budget(config: &Config, doc_paths: &DocPaths) -> (usize, usize) {
    let living_docs_chars: usize = doc_paths
        .living()
        .iter()
        .filter_map(|(_, path)| std::fs::read_to_string(path).ok())
        .map(|content| content.len())
        .sum();

    let remaining = config
        .budget
        .context_limit_chars
        .saturating_sub(living_docs_chars)
        .saturating_sub(config.budget.instructions_overhead);
    let budget = remaining.min(config.budget.max_chunk_chars);
    (budget, living_docs_chars)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

/// Render one queue item as markdown for the chunk input.
fn render_item_content(item: &QueueEntry, project_root: &Path) -> String {
    let tag = if item.pass == "revisit" { "REVISIT" } else { "INITIAL" };
    let item_path = project_root.join(&item.path);

    let header = match item.kind.as_str() {
        "prompts" => {
            let count = item
                .prompt_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string());
            format!(
                "## [USER PROMPTS] Session ({count} prompts)\n**Date:** {}\n\n",
                item.day()
            )
        }
        "issue" => format!(
            "## [{tag}] Issue #{}: {}\n**Created:** {}\n\n",
            item.issue_number.unwrap_or(0),
            item.issue_title.as_deref().unwrap_or(""),
            item.day()
        ),
        _ => {
            let mut header = format!("## [{tag}] Doc: {}\n**Created:** {}", item.path, item.day());
            if tag == "REVISIT" {
                header.push_str(&format!(
                    " | **Modified:** {} | **First seen:** {}\n\
                     This doc was updated since first processed. \
                     Check existing entries and update based on what changed.",
                    item.day(),
                    item.first_seen_date
                        .as_deref()
                        .map(engram_core::dates::day_of)
                        .unwrap_or("?"),
                ));
            }
            header.push_str("\n\n");
            header
        }
    };

    let content = if item.kind == "issue" {
        std::fs::read_to_string(&item_path)
            .ok()
            .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
            .map(|issue| render_issue_markdown(&issue))
            .unwrap_or_else(|| format!("[FILE NOT FOUND: {}]\n", item_path.display()))
    } else {
        std::fs::read_to_string(&item_path)
            .unwrap_or_else(|_| format!("[FILE NOT FOUND: {}]\n", item_path.display()))
    };

    format!("{header}{content}\n\n---\n\n")
}

fn orphan_advisory(report: &DriftReport, fold_from: Option<&str>) -> String {
    if report.orphaned_concepts.is_empty() {
        return String::new();
    }
    let mut advisory =
        String::from("## [ORPHANED CONCEPTS] Active concepts with missing source files\n\n");
    if let (Some(day), Some(commit)) = (fold_from, report.ref_commit.as_deref()) {
        advisory.push_str(&format!(
            "**Note:** Living docs are current through {day} (commit `{}`). \
             Only files missing at that commit are listed.\n\n",
            &commit[..commit.len().min(12)]
        ));
    }
    for orphan in &report.orphaned_concepts {
        advisory.push_str(&format!(
            "- **{}**: {}\n",
            orphan.name,
            orphan.paths.join(", ")
        ));
    }
    advisory.push_str(&format!(
        "\n({} orphaned concepts found)\n\n---\n\n",
        report.orphaned_concepts.len()
    ));
    advisory
}

/// Build the next chunk's input and prompt files.
///
/// Refuses with `LockHeld` while an active chunk exists (after a best-effort
/// auto-clear against recent commit subjects). Returns `QueueMissing` /
/// `QueueEmpty` when there is nothing to assemble.
pub fn next_chunk(
    config: &Config,
    store: &mut StateStore,
    project_root: &Path,
    fold_from: Option<&str>,
) -> Result<ChunkResult, FoldError> {
    let engram_dir = engram_dir(project_root);
    let chunks_dir = engram_dir.join("chunks");
    std::fs::create_dir_all(&chunks_dir)?;

    // Active-lock check first: at most one chunk in flight per project root.
    auto_clear_if_processed(&engram_dir, project_root)?;
    if let Some(lock) = ActiveChunkLock::read(&engram_dir)? {
        return Err(FoldError::LockHeld {
            chunk_id: lock.chunk_id,
            input_path: lock.input_path,
        });
    }

    let queue_file = engram_dir.join(QUEUE_FILE);
    if !queue_file.exists() {
        return Err(FoldError::QueueMissing);
    }
    let mut queue = read_queue(&queue_file);
    if queue.is_empty() {
        return Err(FoldError::QueueEmpty);
    }

    let doc_paths = config.doc_paths(project_root);
    let (budget, living_docs_chars) = compute_budget(config, &doc_paths);
    let manifest_file = manifest_path(&engram_dir);
    let chunk_id = next_chunk_id(&manifest_file);

    let report = scan_drift(config, project_root, fold_from);

    // Drift triage outranks chronological folding; synthesis is additionally
    // suppressed while the registry hash is unchanged within the cooldown
    // window.
    let registry_hash = workflow_registry_hash(&doc_paths);
    let manifest_entries = read_manifest(&manifest_file);
    let drift_type = ChunkType::DRIFT_PRIORITY.into_iter().find(|chunk_type| {
        if !report.exceeds(config, *chunk_type) {
            return false;
        }
        if *chunk_type == ChunkType::WorkflowSynthesis
            && synthesis_on_cooldown(
                &manifest_entries,
                registry_hash.as_deref(),
                chunk_id,
                config.thresholds.workflow_synthesis_cooldown_chunks,
            )
        {
            debug!(chunk_id, "workflow synthesis on cooldown; skipping");
            return false;
        }
        true
    });

    let input_path = chunks_dir.join(format!("chunk_{chunk_id:03}_input.md"));
    let prompt_path = chunks_dir.join(format!("chunk_{chunk_id:03}_prompt.txt"));

    if let Some(chunk_type) = drift_type {
        // Triage chunk — the queue is not consumed.
        let input_content = render_triage_input(
            chunk_type,
            &report,
            chunk_id,
            &doc_paths,
            report.ref_commit.as_deref(),
            fold_from,
        );
        std::fs::write(&input_path, &input_content)?;

        let prompt_content = render_agent_prompt(
            chunk_id,
            chunk_type.as_str(),
            &input_path,
            &doc_paths,
            project_root,
        );
        std::fs::write(&prompt_path, prompt_content)?;

        let entry_count = report.entry_count(chunk_type);
        append_manifest(
            &manifest_file,
            ManifestEntry {
                id: chunk_id,
                chunk_type: chunk_type.as_str().to_string(),
                input_file: file_name(&input_path),
                date_range: None,
                items: None,
                chars: None,
                entries: Some(entry_count),
                workflow_registry_hash: if chunk_type == ChunkType::WorkflowSynthesis {
                    registry_hash
                } else {
                    None
                },
            },
        )?;

        write_lock(&engram_dir, chunk_id, chunk_type, &input_path, &prompt_path)?;
        info!(chunk_id, chunk_type = chunk_type.as_str(), entry_count, "triage chunk written");

        return Ok(ChunkResult {
            chunk_id,
            chunk_type,
            input_path,
            prompt_path,
            items_count: 0,
            chunk_chars: input_content.len(),
            budget,
            living_docs_chars,
            remaining_queue: queue.len(),
            date_range: None,
            drift_entry_count: entry_count,
            pre_assigned: PreAssigned::new(),
        });
    }

    // Chronological fold chunk — consume a prefix of the queue within budget.
    let mut chunk_items: Vec<QueueEntry> = Vec::new();
    let mut chunk_chars = 0usize;
    loop {
        let Some(head_chars) = queue.first().map(|head| head.chars) else {
            break;
        };
        if !chunk_items.is_empty() && chunk_chars + head_chars > budget {
            break;
        }
        if chunk_items.is_empty() && head_chars > budget {
            // Single oversized head item: take it alone, truncated below.
            chunk_items.push(queue.remove(0));
            chunk_chars = budget;
            break;
        }
        let item = queue.remove(0);
        chunk_chars += item.chars;
        chunk_items.push(item);
    }

    let estimates = estimate_new_entities(&chunk_items, config.budget.max_new_ids_per_category);
    let pre_assigned = pre_assign(store, &doc_paths, &estimates)?;

    let date_range = format!(
        "{} to {}",
        chunk_items.first().map(|i| i.day()).unwrap_or("?"),
        chunk_items.last().map(|i| i.day()).unwrap_or("?"),
    );

    let mut items_content = String::new();
    for item in &chunk_items {
        items_content.push_str(&render_item_content(item, project_root));
    }
    if items_content.chars().count() > budget {
        items_content = truncate_chars(&items_content, budget);
        items_content.push_str("\n\n[TRUNCATED TO CHUNK BUDGET]\n");
    }

    let advisory = orphan_advisory(&report, fold_from);
    let input_content = render_chunk_input(
        chunk_id,
        &date_range,
        &items_content,
        &advisory,
        &pre_assigned,
        &doc_paths,
    );
    std::fs::write(&input_path, &input_content)?;

    let prompt_content =
        render_agent_prompt(chunk_id, &date_range, &input_path, &doc_paths, project_root);
    std::fs::write(&prompt_path, prompt_content)?;

    write_queue(&queue_file, &queue)?;

    append_manifest(
        &manifest_file,
        ManifestEntry {
            id: chunk_id,
            chunk_type: ChunkType::Fold.as_str().to_string(),
            input_file: file_name(&input_path),
            date_range: Some(date_range.clone()),
            items: Some(chunk_items.len()),
            chars: Some(chunk_chars),
            entries: None,
            workflow_registry_hash: None,
        },
    )?;

    write_lock(&engram_dir, chunk_id, ChunkType::Fold, &input_path, &prompt_path)?;
    info!(
        chunk_id,
        items = chunk_items.len(),
        chunk_chars,
        remaining = queue.len(),
        "fold chunk written"
    );

    Ok(ChunkResult {
        chunk_id,
        chunk_type: ChunkType::Fold,
        input_path,
        prompt_path,
        items_count: chunk_items.len(),
        chunk_chars,
        budget,
        living_docs_chars,
        remaining_queue: queue.len(),
        date_range: Some(date_range),
        drift_entry_count: 0,
        pre_assigned,
    })
}

fn write_lock(
    engram_dir: &Path,
    chunk_id: i64,
    chunk_type: ChunkType,
    input_path: &Path,
    prompt_path: &Path,
) -> Result<(), FoldError> {
    ActiveChunkLock {
        chunk_id,
        chunk_type: chunk_type.as_str().to_string(),
        input_path: input_path.to_string_lossy().to_string(),
        prompt_path: prompt_path.to_string_lossy().to_string(),
        created_at: now_rfc3339(),
    }
    .write(engram_dir)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_char_boundary_safe() {
        assert_eq!(truncate_chars("héllo", 3), "hél");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn item_rendering_marks_missing_files() {
        let item = QueueEntry {
            date: "2026-01-01".to_string(),
            kind: "doc".to_string(),
            path: "docs/missing.md".to_string(),
            chars: 10,
            pass: "initial".to_string(),
            first_seen_date: None,
            issue_number: None,
            issue_title: None,
            session_id: None,
            prompt_count: None,
        };
        let rendered = render_item_content(&item, Path::new("/nonexistent-root"));
        assert!(rendered.contains("[FILE NOT FOUND:"));
        assert!(rendered.contains("## [INITIAL] Doc: docs/missing.md"));
    }

    #[test]
    fn revisit_header_references_first_seen() {
        let item = QueueEntry {
            date: "2026-02-01T00:00:00+00:00".to_string(),
            kind: "doc".to_string(),
            path: "docs/x.md".to_string(),
            chars: 10,
            pass: "revisit".to_string(),
            first_seen_date: Some("2026-01-01T00:00:00+00:00".to_string()),
            issue_number: None,
            issue_title: None,
            session_id: None,
            prompt_count: None,
        };
        let rendered = render_item_content(&item, Path::new("/nonexistent-root"));
        assert!(rendered.contains("[REVISIT]"));
        assert!(rendered.contains("**First seen:** 2026-01-01"));
    }
}
