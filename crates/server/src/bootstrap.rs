#![forbid(unsafe_code)]

//! Bootstrap: seed the living docs from a repo snapshot, then optionally fold
//! history forward from a start date.
//!
//! Seed paths: **B** (no date) snapshots the current repo state; **A**
//! (with a date) checks the repo out at the nearest commit in an ephemeral
//! worktree, seeds from that snapshot, sets the fold-from marker, and runs a
//! forward fold to the present. Path **C** (`engram fold --from`) is the
//! forward fold alone.

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

use crate::dispatch::invoke_agent;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::ServerError;
use crate::templates;
use engram_core::{Config, IdCategory};
use engram_fold::ids::pre_assign;
use engram_fold::prompt::render_seed_input;
use engram_fold::sources::render_issue_markdown;
use engram_fold::{build_queue, engram_dir};
use engram_storage::StateStore;

/// Identifier budget reserved for the seed round.
const SEED_ID_BUDGET: [(IdCategory, usize); 3] = [
    (IdCategory::Concept, 30),
    (IdCategory::Epistemic, 20),
    (IdCategory::Workflow, 10),
];

const SNAPSHOT_DOC_CAP: usize = 20;
const SNAPSHOT_DOC_CHARS: usize = 8_000;
const SNAPSHOT_ISSUE_CAP: usize = 30;

/// Create missing living docs and graveyard files with schema headers.
pub fn ensure_living_docs(config: &Config, project_root: &Path) -> Result<(), ServerError> {
    let doc_paths = config.doc_paths(project_root);
    for (key, path) in doc_paths.living() {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, templates::living_header(key))?;
        }
    }
    for (key, path) in doc_paths.graveyards() {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, templates::graveyard_header(key))?;
        }
    }
    Ok(())
}

fn find_commit_at_date(project_root: &Path, day: &str) -> Result<String, ServerError> {
    let until = format!("--until={day}T23:59:59");
    engram_fold::git::run_git(project_root, &["log", &until, "--format=%H", "-1"])
        .filter(|sha| !sha.is_empty())
        .ok_or_else(|| ServerError::Git(format!("no commit found on or before {day}")))
}

fn create_worktree(project_root: &Path, commit: &str) -> Result<PathBuf, ServerError> {
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let worktree_dir = std::env::temp_dir().join(format!("engram-seed-{nonce}"));

    let worktree_arg = worktree_dir.to_string_lossy().to_string();
    let output = Command::new("git")
        .args(["worktree", "add", "--detach", worktree_arg.as_str(), commit])
        .current_dir(project_root)
        .output()?;
    if !output.status.success() {
        return Err(ServerError::Git(format!(
            "worktree add failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    info!(worktree = %worktree_dir.display(), commit = &commit[..commit.len().min(8)], "created seed worktree");
    Ok(worktree_dir)
}

fn remove_worktree(project_root: &Path, worktree_dir: &Path) {
    let worktree_arg = worktree_dir.to_string_lossy().to_string();
    let _ = Command::new("git")
        .args(["worktree", "remove", "--force", worktree_arg.as_str()])
        .current_dir(project_root)
        .output();
    if worktree_dir.exists() {
        let _ = std::fs::remove_dir_all(worktree_dir);
    }
}

/// Collect a textual snapshot of the repo at `source_root` for the seed
/// agent: directory structure, README, key config files, sample docs and
/// issues.
fn collect_repo_snapshot(source_root: &Path, config: &Config) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(tree) = directory_tree(source_root, 3) {
        parts.push(format!("## Repository Structure\n\n```\n{tree}\n```\n"));
    }

    for name in ["README.md", "readme.md", "README"] {
        let readme = source_root.join(name);
        if let Ok(content) = std::fs::read_to_string(&readme) {
            let capped: String = content.chars().take(10_000).collect();
            parts.push(format!("## {name}\n\n{capped}\n"));
            break;
        }
    }

    for name in ["Cargo.toml", "pyproject.toml", "package.json", "go.mod", "CLAUDE.md"] {
        let path = source_root.join(name);
        if let Ok(content) = std::fs::read_to_string(&path) {
            let capped: String = content.chars().take(5_000).collect();
            parts.push(format!("## {name}\n\n```\n{capped}\n```\n"));
        }
    }

    let mut docs_collected = 0usize;
    for dir in &config.sources.docs {
        let dir_path = source_root.join(dir);
        let Ok(entries) = std::fs::read_dir(&dir_path) else {
            continue;
        };
        let mut doc_files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        doc_files.sort();
        for doc_path in doc_files {
            if docs_collected >= SNAPSHOT_DOC_CAP {
                break;
            }
            let Ok(content) = std::fs::read_to_string(&doc_path) else {
                continue;
            };
            let capped: String = content.chars().take(SNAPSHOT_DOC_CHARS).collect();
            let rel = doc_path
                .strip_prefix(source_root)
                .unwrap_or(&doc_path)
                .to_string_lossy()
                .to_string();
            parts.push(format!("## Doc: {rel}\n\n{capped}\n"));
            docs_collected += 1;
        }
    }

    let issues_dir = source_root.join(&config.sources.issues);
    if let Ok(entries) = std::fs::read_dir(&issues_dir) {
        let mut issue_files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        issue_files.sort();
        let mut issue_parts = Vec::new();
        for path in issue_files.into_iter().take(SNAPSHOT_ISSUE_CAP) {
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Ok(issue) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };
            let number = issue
                .get("number")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0);
            let title = issue
                .get("title")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            let rendered: String = render_issue_markdown(&issue).chars().take(3_000).collect();
            issue_parts.push(format!("### Issue #{number}: {title}\n\n{rendered}\n"));
        }
        if !issue_parts.is_empty() {
            parts.push(format!("## Issues\n\n{}", issue_parts.join("\n")));
        }
    }

    parts.join("\n\n---\n\n")
}

fn directory_tree(root: &Path, max_depth: usize) -> Option<String> {
    let mut lines = Vec::new();
    walk_tree(root, root, max_depth, &mut lines).ok()?;
    lines.sort();
    if lines.is_empty() { None } else { Some(lines.join("\n")) }
}

fn walk_tree(
    root: &Path,
    dir: &Path,
    depth_left: usize,
    lines: &mut Vec<String>,
) -> std::io::Result<()> {
    if depth_left == 0 {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)?.filter_map(|e| e.ok()) {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name == "node_modules" || name == "target" || name == "venv" {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(root) {
            lines.push(format!("./{}", rel.to_string_lossy()));
        }
        if path.is_dir() {
            walk_tree(root, &path, depth_left - 1, lines)?;
        }
    }
    Ok(())
}

fn dispatch_seed_agent(
    config: &Config,
    project_root: &Path,
    store: &mut StateStore,
    snapshot: &str,
) -> Result<(), ServerError> {
    let engram = engram_dir(project_root);
    std::fs::create_dir_all(&engram)?;
    let doc_paths = config.doc_paths(project_root);

    let estimates = SEED_ID_BUDGET.into_iter().collect();
    let pre_assigned = pre_assign(store, &doc_paths, &estimates)?;

    let input_content = format!(
        "{}\n\n---\n\n# Repository Snapshot\n\n{snapshot}",
        render_seed_input(&doc_paths, &pre_assigned)
    );
    let input_path = engram.join("seed_input.md");
    std::fs::write(&input_path, input_content)?;

    let doc_list: Vec<String> = doc_paths
        .living()
        .iter()
        .enumerate()
        .map(|(i, (_, path))| format!("{}. {}", i + 1, path.display()))
        .collect();
    let graveyard_list: Vec<String> = doc_paths
        .graveyards()
        .iter()
        .map(|(_, path)| format!("- {}", path.display()))
        .collect();

    let prompt = format!(
        "You are bootstrapping a project's knowledge base.\n\
         \n\
         IMPORTANT CONSTRAINTS:\n\
         - Do NOT use the Task tool or spawn sub-agents. Do all work directly.\n\
         - Do NOT use Write to overwrite entire files. Use Edit for surgical updates only.\n\
         - Be SUCCINCT. High information density, no filler.\n\
         \n\
         Read the input file at {input} — it contains seed instructions\n\
         and a snapshot of the repository.\n\
         \n\
         Follow the instructions. Populate these 4 living documents:\n\
         \n\
         {docs}\n\
         \n\
         Graveyard files (append-only):\n\
         \n\
         {graveyards}\n\
         \n\
         Read each living doc first, then make surgical edits to populate entries.\n\
         \n\
         Rules:\n\
         - Use ONLY pre-assigned IDs for new entries (listed in the input file)\n\
         - Extract concepts, claims, timeline events, workflows from the snapshot\n\
         - Be succinct: 5 lines per entry ideal, 10 max\n",
        input = input_path.display(),
        docs = doc_list.join("\n"),
        graveyards = graveyard_list.join("\n"),
    );
    std::fs::write(engram.join("seed_prompt.txt"), &prompt)?;

    info!("dispatching seed agent");
    invoke_agent(config, project_root, &prompt)
}

/// Run bootstrap seed. With `from_date` (path A) the repo is snapshotted at
/// that date and the fold-from marker is set before folding forward; without
/// it (path B) the current state is seeded. Both paths mark the briefing
/// stale explicitly on success.
pub fn seed(
    config: &Config,
    project_root: &Path,
    from_date: Option<&str>,
) -> Result<(), ServerError> {
    if let Some(day) = from_date {
        engram_core::dates::parse_day(day)
            .map_err(|_| ServerError::Fold(engram_fold::FoldError::InvalidStartDate(day.to_string())))?;
    }

    ensure_living_docs(config, project_root)?;
    let mut store = StateStore::open(engram_dir(project_root))?;

    let mut worktree: Option<PathBuf> = None;
    let result = (|| -> Result<(), ServerError> {
        let source_root = match from_date {
            Some(day) => {
                let commit = find_commit_at_date(project_root, day)?;
                let dir = create_worktree(project_root, &commit)?;
                info!(day, commit = &commit[..commit.len().min(8)], "seeding from snapshot");
                worktree = Some(dir.clone());
                dir
            }
            None => {
                info!("seeding from current repo state");
                project_root.to_path_buf()
            }
        };

        let snapshot = collect_repo_snapshot(&source_root, config);
        dispatch_seed_agent(config, project_root, &mut store, &snapshot)?;
        store.mark_l0_stale()?;

        if let Some(day) = from_date {
            store.set_fold_from(day)?;
            info!(day, "seed complete; folding forward");
            forward_fold(config, project_root, &mut store, day)?;
        }
        Ok(())
    })();

    if let Some(dir) = worktree {
        remove_worktree(project_root, &dir);
    }
    result
}

/// Forward fold: build the queue from `from_day` and dispatch chunks until
/// it drains. The fold-from marker is cleared on the empty-queue early
/// return and on successful completion; any failing chunk preserves it.
pub fn forward_fold(
    config: &Config,
    project_root: &Path,
    store: &mut StateStore,
    from_day: &str,
) -> Result<usize, ServerError> {
    info!(from_day, "building queue for forward fold");
    let entries = build_queue(config, project_root, Some(from_day))?;
    if entries.is_empty() {
        info!(from_day, "no entries to process");
        store.clear_fold_from()?;
        return Ok(0);
    }
    info!(count = entries.len(), "processing entries");

    store.set_fold_from(from_day)?;
    let dispatcher = Dispatcher::new(config, project_root);
    let mut chunks = 0usize;

    loop {
        match dispatcher.dispatch(store)? {
            DispatchOutcome::Committed => {
                chunks += 1;
            }
            DispatchOutcome::QueueDrained => {
                info!(chunks, "queue exhausted");
                break;
            }
            DispatchOutcome::LockHeld => {
                let lock = engram_fold::ActiveChunkLock::read(&engram_dir(project_root))?;
                return Err(ServerError::Fold(engram_fold::FoldError::LockHeld {
                    chunk_id: lock.as_ref().map(|l| l.chunk_id).unwrap_or(0),
                    input_path: lock.map(|l| l.input_path).unwrap_or_default(),
                }));
            }
            DispatchOutcome::Failed => {
                warn!(chunks, "forward fold stopping on failed chunk; fold_from preserved");
                return Err(ServerError::Agent(
                    "forward fold chunk failed; fold_from marker preserved".to_string(),
                ));
            }
        }
    }

    store.clear_fold_from()?;
    info!(chunks, "forward fold completed");
    Ok(chunks)
}
