#![forbid(unsafe_code)]

//! Serial dispatch to the fold agent with linting and retry.
//!
//! Lifecycle per chunk: `building → dispatched → validated → committed`, with
//! `dispatched → retry → dispatched` (≤ 2) and `dispatched → failed` as the
//! alternative edges. On success the staleness flag is set strictly before
//! the committed transition (crash-safe ordering) and the active-chunk lock
//! is cleared; on failure the lock stays for human review.

use std::path::Path;
use tracing::{error, info, warn};

use crate::dispatch::invoke_agent;
use crate::error::ServerError;
use engram_core::linter::{self, LintResult, is_size_guard_violation};
use engram_core::Config;
use engram_fold::chunker::ChunkResult;
use engram_fold::ids::flatten;
use engram_fold::queue::{QUEUE_FILE, QueueEntry, read_queue, write_queue};
use engram_fold::{ActiveChunkLock, FoldError, engram_dir, next_chunk};
use engram_storage::{BufferItem, DispatchRow, DispatchState, ItemKind, StateStore};

pub const MAX_RETRIES: i64 = 2;

/// What a dispatch cycle accomplished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Chunk processed and committed.
    Committed,
    /// Nothing to do: the queue is missing or drained.
    QueueDrained,
    /// An active chunk already exists; nothing was produced.
    LockHeld,
    /// Chunk failed after retries; the lock was left in place.
    Failed,
}

pub struct Dispatcher<'a> {
    config: &'a Config,
    project_root: &'a Path,
}

impl<'a> Dispatcher<'a> {
    pub fn new(config: &'a Config, project_root: &'a Path) -> Self {
        Self {
            config,
            project_root,
        }
    }

    /// Execute a single dispatch cycle: flush the buffer into the queue,
    /// build a chunk, run the agent, lint, and commit.
    pub fn dispatch(&self, store: &mut StateStore) -> Result<DispatchOutcome, ServerError> {
        let doc_paths = self.config.doc_paths(self.project_root);
        let before_contents = doc_paths.read_living();

        let flushed = self.flush_buffer_to_queue(store)?;
        if flushed > 0 {
            info!(flushed, "flushed buffered items into queue");
        }

        let fold_from = store.fold_from()?;
        let chunk = match next_chunk(self.config, store, self.project_root, fold_from.as_deref()) {
            Ok(chunk) => chunk,
            Err(FoldError::QueueMissing | FoldError::QueueEmpty) => {
                return Ok(DispatchOutcome::QueueDrained);
            }
            Err(err @ FoldError::LockHeld { .. }) => {
                warn!(%err, "cannot build chunk");
                return Ok(DispatchOutcome::LockHeld);
            }
            Err(err) => return Err(err.into()),
        };

        let dispatch_id = store.dispatch_begin(
            chunk.chunk_id,
            chunk.chunk_type.as_str(),
            Some(&chunk.input_path.to_string_lossy()),
            Some(&chunk.prompt_path.to_string_lossy()),
        )?;
        store.dispatch_set_state(dispatch_id, DispatchState::Dispatched, None)?;

        if self.execute_and_validate(store, dispatch_id, &chunk, &before_contents)? {
            self.commit(store, dispatch_id)?;
            info!(dispatch_id, chunk_id = chunk.chunk_id, "dispatch committed");
            Ok(DispatchOutcome::Committed)
        } else {
            store.dispatch_set_state(
                dispatch_id,
                DispatchState::Failed,
                Some("failed after retries; active chunk left for review"),
            )?;
            error!(dispatch_id, chunk_id = chunk.chunk_id, "dispatch failed after retries");
            Ok(DispatchOutcome::Failed)
        }
    }

    /// `validated → committed` with the staleness flag set in between, then
    /// release the active-chunk lock and stamp the dispatch time.
    fn commit(&self, store: &mut StateStore, dispatch_id: i64) -> Result<(), ServerError> {
        store.dispatch_set_state(dispatch_id, DispatchState::Validated, None)?;
        store.mark_l0_stale()?; // stale BEFORE committed — crash-safe ordering
        store.dispatch_set_state(dispatch_id, DispatchState::Committed, None)?;
        ActiveChunkLock::clear(&engram_dir(self.project_root))?;
        store.touch_last_dispatch_time()?;
        Ok(())
    }

    fn execute_and_validate(
        &self,
        store: &mut StateStore,
        dispatch_id: i64,
        chunk: &ChunkResult,
        before_contents: &std::collections::BTreeMap<String, String>,
    ) -> Result<bool, ServerError> {
        let doc_paths = self.config.doc_paths(self.project_root);
        let pre_assigned = flatten(&chunk.pre_assigned);
        let base_prompt = std::fs::read_to_string(&chunk.prompt_path)?;
        let mut correction: Option<String> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let retry_count = store.dispatch_bump_retry(dispatch_id)?;
                store.dispatch_set_state(dispatch_id, DispatchState::Retry, None)?;
                store.dispatch_set_state(dispatch_id, DispatchState::Dispatched, None)?;
                info!(dispatch_id, retry_count, "retrying dispatch");
            }

            let prompt = match &correction {
                Some(text) => format!("{base_prompt}\n\n{text}"),
                None => base_prompt.clone(),
            };

            if let Err(err) = invoke_agent(self.config, self.project_root, &prompt) {
                store.dispatch_set_state(
                    dispatch_id,
                    DispatchState::Dispatched,
                    Some(&err.to_string()),
                )?;
                continue;
            }

            let after_contents = doc_paths.read_living();
            let graveyards = doc_paths.read_graveyards();
            let result = linter::lint_post_dispatch(
                before_contents,
                &after_contents,
                &graveyards,
                &pre_assigned,
                chunk.chunk_chars,
            );

            if result.passed() {
                return Ok(true);
            }

            warn!(
                dispatch_id,
                violations = result.violations.len(),
                "lint failed after agent run"
            );
            for violation in &result.violations {
                warn!("  {violation}");
            }

            // A diff that only trips the size guard gets a single retry.
            let only_size_guard = result.violations.iter().all(is_size_guard_violation);
            if only_size_guard && attempt >= 1 {
                break;
            }

            correction = Some(correction_text(Some(chunk), &result));
            store.dispatch_set_state(
                dispatch_id,
                DispatchState::Dispatched,
                Some(&format!("lint failed: {} violations", result.violations.len())),
            )?;
        }

        Ok(false)
    }

    /// Recover a dispatch found in non-terminal state on startup.
    ///
    /// `validated` rows finish their transition (the staleness flag is set
    /// idempotently first). `dispatched` rows are re-linted: the agent may
    /// have completed before the crash; otherwise one re-dispatch is
    /// attempted while retry budget remains.
    pub fn recover(
        &self,
        store: &mut StateStore,
        dispatch: &DispatchRow,
    ) -> Result<bool, ServerError> {
        let doc_paths = self.config.doc_paths(self.project_root);

        if dispatch.state == DispatchState::Validated {
            self.commit(store, dispatch.id)?;
            info!(dispatch_id = dispatch.id, "recovered validated dispatch as committed");
            return Ok(true);
        }

        let living = doc_paths.read_living();
        let graveyards = doc_paths.read_graveyards();
        let result = linter::lint(&living, &graveyards);
        if result.passed() {
            self.commit(store, dispatch.id)?;
            info!(dispatch_id = dispatch.id, "recovered dispatched chunk as committed");
            return Ok(true);
        }

        if dispatch.retry_count < MAX_RETRIES {
            if let Some(prompt_path) = dispatch.prompt_path.as_deref() {
                if Path::new(prompt_path).exists() {
                    info!(
                        dispatch_id = dispatch.id,
                        retry_count = dispatch.retry_count + 1,
                        "recovery re-dispatch"
                    );
                    store.dispatch_bump_retry(dispatch.id)?;
                    let prompt = std::fs::read_to_string(prompt_path)?;
                    let full = format!("{prompt}\n\n{}", correction_text(None, &result));
                    if invoke_agent(self.config, self.project_root, &full).is_ok() {
                        let living = doc_paths.read_living();
                        let graveyards = doc_paths.read_graveyards();
                        if linter::lint(&living, &graveyards).passed() {
                            self.commit(store, dispatch.id)?;
                            info!(dispatch_id = dispatch.id, "recovery re-dispatch committed");
                            return Ok(true);
                        }
                    }
                }
            }
        }

        store.dispatch_set_state(
            dispatch.id,
            DispatchState::Failed,
            Some("recovered: could not validate after retries"),
        )?;
        warn!(dispatch_id = dispatch.id, "recovered dispatch as failed");
        Ok(false)
    }

    /// Move pending buffer items into `queue.jsonl` for chunking, deduping
    /// by path and keeping the queue date-sorted. Items are consumed from the
    /// buffer atomically.
    fn flush_buffer_to_queue(&self, store: &mut StateStore) -> Result<usize, ServerError> {
        let items = store.buffer_items()?;
        if items.is_empty() {
            return Ok(0);
        }

        let engram = engram_dir(self.project_root);
        std::fs::create_dir_all(&engram)?;
        let queue_file = engram.join(QUEUE_FILE);
        let mut queue = read_queue(&queue_file);

        let mut existing_paths: std::collections::BTreeSet<String> =
            queue.iter().map(|entry| entry.path.clone()).collect();
        let mut consume_ids = Vec::new();
        let mut added = 0usize;

        for item in &items {
            consume_ids.push(item.id);
            let Some(entry) = buffer_item_to_queue_entry(self.project_root, item) else {
                continue;
            };
            if existing_paths.contains(&entry.path) {
                continue;
            }
            existing_paths.insert(entry.path.clone());
            queue.push(entry);
            added += 1;
        }

        queue.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.path.cmp(&b.path)));
        write_queue(&queue_file, &queue)?;
        store.buffer_consume(&consume_ids)?;
        Ok(added)
    }
}

/// Correction context appended to the retry prompt so the agent sees the
/// violations from the previous attempt.
fn correction_text(chunk: Option<&ChunkResult>, result: &LintResult) -> String {
    let violations: Vec<String> = result
        .violations
        .iter()
        .map(|violation| format!("- {violation}"))
        .collect();
    let reread = match chunk {
        Some(chunk) => format!(
            " Re-read the input file at {} for context.",
            chunk.input_path.display()
        ),
        None => String::new(),
    };
    format!(
        "CORRECTION REQUIRED: The previous fold attempt had {count} lint violations:\n\n\
         {violations}\n\n\
         Please fix these violations in the living docs.{reread}\n",
        count = result.violations.len(),
        violations = violations.join("\n"),
    )
}

/// Convert a buffered watcher item into the queue entry schema. Watcher doc
/// events are re-reads of known files, so they enter as revisit passes.
fn buffer_item_to_queue_entry(project_root: &Path, item: &BufferItem) -> Option<QueueEntry> {
    let date = item
        .date
        .clone()
        .unwrap_or_else(|| item.added_at.clone());

    match item.kind {
        ItemKind::Doc => Some(QueueEntry {
            date,
            kind: "doc".to_string(),
            path: item.path.clone(),
            chars: item.chars.max(0) as usize,
            pass: "revisit".to_string(),
            first_seen_date: None,
            issue_number: None,
            issue_title: None,
            session_id: None,
            prompt_count: None,
        }),
        ItemKind::Issue => {
            let (number, title) = resolve_issue_metadata(project_root, &item.path);
            Some(QueueEntry {
                date,
                kind: "issue".to_string(),
                path: item.path.clone(),
                chars: item.chars.max(0) as usize,
                pass: "initial".to_string(),
                first_seen_date: None,
                issue_number: Some(number),
                issue_title: Some(title),
                session_id: None,
                prompt_count: None,
            })
        }
        ItemKind::Prompts => {
            let prompt_count = item
                .metadata
                .as_deref()
                .and_then(|meta| serde_json::from_str::<serde_json::Value>(meta).ok())
                .and_then(|meta| meta.get("prompt_count").and_then(serde_json::Value::as_u64))
                .map(|n| n.max(1) as usize)
                .unwrap_or(1);
            let session_id = Path::new(&item.path)
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string());
            Some(QueueEntry {
                date,
                kind: "prompts".to_string(),
                path: item.path.clone(),
                chars: item.chars.max(0) as usize,
                pass: "initial".to_string(),
                first_seen_date: None,
                issue_number: None,
                issue_title: None,
                session_id,
                prompt_count: Some(prompt_count),
            })
        }
        ItemKind::Drift => None,
    }
}

/// Issue number/title from the snapshot JSON, falling back to filename digits.
fn resolve_issue_metadata(project_root: &Path, rel_path: &str) -> (i64, String) {
    let issue_path = project_root.join(rel_path);
    if let Ok(text) = std::fs::read_to_string(&issue_path) {
        if let Ok(issue) = serde_json::from_str::<serde_json::Value>(&text) {
            let number = issue
                .get("number")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0);
            let title = issue
                .get("title")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("")
                .to_string();
            if number != 0 {
                return (number, title);
            }
        }
    }

    let number = Path::new(rel_path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .and_then(|stem| {
            let digits: String = stem.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .unwrap_or(0);
    (number, String::new())
}
