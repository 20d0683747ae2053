#![forbid(unsafe_code)]

//! Chronological queue building from project artifacts.
//!
//! Gathers doc, issue, and session entries, sorts them by date (lexicographic
//! on ISO strings is chronological), applies the optional start-date filter,
//! and writes `queue.jsonl` plus a full unfiltered `item_sizes.json`
//! inventory. Session markdown is only written for entries that survive the
//! filter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::sessions::adapter_for;
use crate::sources::{
    doc_git_dates, extract_issue_number, list_markdown_docs, parse_frontmatter_date,
    render_issue_markdown,
};
use crate::{FoldError, engram_dir};
use engram_core::dates::{day_of, parse_datetime, parse_day};
use engram_core::Config;

pub const QUEUE_FILE: &str = "queue.jsonl";
pub const ITEM_SIZES_FILE: &str = "item_sizes.json";

/// Dual-pass threshold: a doc modified at least this many days after its
/// creation gets a REVISIT entry.
const REVISIT_THRESHOLD_DAYS: i64 = 7;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueEntry {
    pub date: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub chars: usize,
    pub pass: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_count: Option<usize>,
}

impl QueueEntry {
    pub fn day(&self) -> &str {
        day_of(&self.date)
    }
}

/// Read `queue.jsonl`, skipping blank and malformed lines.
pub fn read_queue(queue_file: &Path) -> Vec<QueueEntry> {
    let Ok(text) = std::fs::read_to_string(queue_file) else {
        return Vec::new();
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Rewrite `queue.jsonl` with the given entries.
pub fn write_queue(queue_file: &Path, entries: &[QueueEntry]) -> Result<(), FoldError> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    std::fs::write(queue_file, out)?;
    Ok(())
}

/// Drain predicate for L0 regeneration: the queue file is missing, empty, or
/// holds no entries. The check is against the queue, not the buffer — the
/// queue is what feeds chunk content, the buffer is what triggers dispatch.
pub fn queue_is_empty(project_root: &Path) -> bool {
    let queue_file = engram_dir(project_root).join(QUEUE_FILE);
    let Ok(text) = std::fs::read_to_string(&queue_file) else {
        return true;
    };
    !text.lines().any(|line| !line.trim().is_empty())
}

/// Build the chronological queue of all artifacts.
///
/// `start_date` must be a strict `YYYY-MM-DD` day; it is validated before any
/// I/O so an invalid date can have no side effects. When set, only entries
/// with `date[:10] >= start_date` survive into the queue and the session
/// snapshot directory.
pub fn build_queue(
    config: &Config,
    project_root: &Path,
    start_date: Option<&str>,
) -> Result<Vec<QueueEntry>, FoldError> {
    if let Some(day) = start_date {
        parse_day(day).map_err(|_| FoldError::InvalidStartDate(day.to_string()))?;
    }

    let output_dir = engram_dir(project_root);
    std::fs::create_dir_all(&output_dir)?;

    let issues_dir = project_root.join(&config.sources.issues);
    let project_start = config.project_start.as_deref();

    // Issue creation dates, used to cross-reference docs named `<number>_*`.
    let mut issue_dates: BTreeMap<i64, String> = BTreeMap::new();
    let mut issue_files: Vec<PathBuf> = Vec::new();
    if issues_dir.exists() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&issues_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort();
        for path in &entries {
            match read_issue(path) {
                Some(issue) => {
                    if let (Some(number), Some(created)) = (
                        issue.get("number").and_then(serde_json::Value::as_i64),
                        issue.get("createdAt").and_then(serde_json::Value::as_str),
                    ) {
                        issue_dates.insert(number, created.to_string());
                    }
                }
                None => warn!(path = %path.display(), "skipping malformed issue snapshot"),
            }
        }
        issue_files = entries;
    }

    let mut entries: Vec<QueueEntry> = Vec::new();
    let mut sizes: BTreeMap<String, usize> = BTreeMap::new();

    // --- Docs ---
    for doc_path in list_markdown_docs(project_root, &config.sources.docs) {
        let Ok(content) = std::fs::read_to_string(&doc_path) else {
            continue;
        };
        let char_count = content.len();
        let rel_path = match doc_path.strip_prefix(project_root) {
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => continue,
        };
        sizes.insert(rel_path.clone(), char_count);

        // Created date priority: frontmatter > issue cross-ref > git > mtime.
        let mut created = parse_frontmatter_date(&doc_path, project_start);
        if created.is_none() {
            created = extract_issue_number(&doc_path)
                .and_then(|n| issue_dates.get(&n).cloned());
        }
        let (git_created, git_modified) = doc_git_dates(&doc_path, project_root);
        if created.is_none() {
            created = git_created;
        }
        let created = created.unwrap_or_else(|| file_mtime_iso(&doc_path));
        let modified = git_modified.unwrap_or_else(|| created.clone());

        entries.push(QueueEntry {
            date: created.clone(),
            kind: "doc".to_string(),
            path: rel_path.clone(),
            chars: char_count,
            pass: "initial".to_string(),
            first_seen_date: None,
            issue_number: None,
            issue_title: None,
            session_id: None,
            prompt_count: None,
        });

        if revisit_gap_days(&created, &modified) >= REVISIT_THRESHOLD_DAYS {
            entries.push(QueueEntry {
                date: modified,
                kind: "doc".to_string(),
                path: rel_path,
                chars: char_count,
                pass: "revisit".to_string(),
                first_seen_date: Some(created),
                issue_number: None,
                issue_title: None,
                session_id: None,
                prompt_count: None,
            });
        }
    }

    // --- Issues ---
    for path in &issue_files {
        let Some(issue) = read_issue(path) else {
            continue;
        };
        let (Some(number), Some(created)) = (
            issue.get("number").and_then(serde_json::Value::as_i64),
            issue.get("createdAt").and_then(serde_json::Value::as_str),
        ) else {
            warn!(path = %path.display(), "skipping issue without number/createdAt");
            continue;
        };
        let rendered = render_issue_markdown(&issue);
        let rel_path = match path.strip_prefix(project_root) {
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => continue,
        };
        sizes.insert(rel_path.clone(), rendered.len());

        entries.push(QueueEntry {
            date: created.to_string(),
            kind: "issue".to_string(),
            path: rel_path,
            chars: rendered.len(),
            pass: "initial".to_string(),
            first_seen_date: None,
            issue_number: Some(number),
            issue_title: issue
                .get("title")
                .and_then(serde_json::Value::as_str)
                .map(String::from),
            session_id: None,
            prompt_count: None,
        });
    }

    // --- Sessions (drafts held in memory until the filter has run) ---
    let session_cfg = &config.sources.sessions;
    let session_path = expand_tilde(&session_cfg.path);
    let adapter = adapter_for(&session_cfg.format)?;
    let session_entries = adapter.parse(&session_path, &session_cfg.project_match);

    let sessions_dir = output_dir.join("sessions");
    std::fs::create_dir_all(&sessions_dir)?;

    let mut pending_sessions: Vec<(String, String, String)> = Vec::new();
    for session in session_entries {
        let rel_path = format!(".engram/sessions/{}.md", session.session_id);
        sizes.insert(rel_path.clone(), session.chars);
        entries.push(QueueEntry {
            date: session.date.clone(),
            kind: "prompts".to_string(),
            path: rel_path.clone(),
            chars: session.chars,
            pass: "initial".to_string(),
            first_seen_date: None,
            issue_number: None,
            issue_title: None,
            session_id: Some(session.session_id.clone()),
            prompt_count: Some(session.prompt_count),
        });
        pending_sessions.push((rel_path, session.session_id, session.rendered));
    }

    // Chronological order; ties broken by stable source-path order.
    entries.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.path.cmp(&b.path)));

    if let Some(day) = start_date {
        entries.retain(|entry| entry.day() >= day);
    }

    // Write only surviving session snapshots; filtered drafts are discarded.
    let surviving: std::collections::BTreeSet<&str> = entries
        .iter()
        .filter(|e| e.kind == "prompts")
        .map(|e| e.path.as_str())
        .collect();
    for (rel_path, session_id, rendered) in &pending_sessions {
        if surviving.contains(rel_path.as_str()) {
            std::fs::write(sessions_dir.join(format!("{session_id}.md")), rendered)?;
        }
    }

    write_queue(&output_dir.join(QUEUE_FILE), &entries)?;
    std::fs::write(
        output_dir.join(ITEM_SIZES_FILE),
        serde_json::to_string_pretty(&sizes)?,
    )?;

    Ok(entries)
}

fn read_issue(path: &Path) -> Option<serde_json::Value> {
    let text = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

fn file_mtime_iso(path: &Path) -> String {
    let mtime = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|st| st.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    engram_core::dates::from_unix_seconds(mtime)
        .and_then(|dt| {
            dt.format(&time::format_description::well_known::Rfc3339)
                .ok()
        })
        .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
}

fn revisit_gap_days(created: &str, modified: &str) -> i64 {
    match (parse_datetime(created), parse_datetime(modified)) {
        (Some(created), Some(modified)) => (modified - created).whole_days(),
        _ => 0,
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_entry_serialization_omits_empty_fields() {
        let entry = QueueEntry {
            date: "2026-01-01T00:00:00+00:00".to_string(),
            kind: "doc".to_string(),
            path: "docs/a.md".to_string(),
            chars: 42,
            pass: "initial".to_string(),
            first_seen_date: None,
            issue_number: None,
            issue_title: None,
            session_id: None,
            prompt_count: None,
        };
        let json = serde_json::to_string(&entry).expect("serialize");
        assert!(json.contains("\"type\":\"doc\""));
        assert!(!json.contains("issue_number"));
        let back: QueueEntry = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.path, "docs/a.md");
    }

    #[test]
    fn revisit_gap_is_in_days() {
        assert_eq!(
            revisit_gap_days("2026-01-01T00:00:00+00:00", "2026-01-09T00:00:00+00:00"),
            8
        );
        assert_eq!(revisit_gap_days("2026-01-01", "garbage"), 0);
    }

    #[test]
    fn day_accessor_truncates() {
        let entry = QueueEntry {
            date: "2026-01-15T08:00:00+00:00".to_string(),
            kind: "doc".to_string(),
            path: "a.md".to_string(),
            chars: 1,
            pass: "initial".to_string(),
            first_seen_date: None,
            issue_number: None,
            issue_title: None,
            session_id: None,
            prompt_count: None,
        };
        assert_eq!(entry.day(), "2026-01-15");
    }
}
