#![forbid(unsafe_code)]

//! Session history adapters for ingesting user prompts.
//!
//! Two built-in formats: `claude-code` parses `~/.claude/history.jsonl`,
//! `codex` parses `~/.codex/history.jsonl` with project matching resolved
//! through session logs. Both tolerate malformed lines by skipping them.

use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::FoldError;
use engram_core::dates;

/// Minimum prompt length to include (filters slash commands and trivia).
const MIN_PROMPT_CHARS: usize = 25;
const RELAY_MAX_CHARS: usize = 320;

static SM_TELEMETRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\[sm[^\]]*\]").expect("SM_TELEMETRY_RE should compile"));
static RELAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\[input from:[^\]]+\]").expect("RELAY_RE should compile")
});
static SESSION_FILE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})")
        .expect("SESSION_FILE_ID_RE should compile")
});
static CWD_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<cwd>([^<]+)</cwd>").expect("CWD_TAG_RE should compile"));

/// A single parsed session with rendered markdown content.
#[derive(Clone, Debug)]
pub struct SessionEntry {
    pub session_id: String,
    pub date: String,
    pub chars: usize,
    pub prompt_count: usize,
    pub rendered: String,
}

/// A session history adapter. `parse_incremental` reads only bytes appended
/// after `start_offset` and returns the new byte offset for bookmarking.
pub trait SessionAdapter {
    fn parse_incremental(
        &self,
        path: &Path,
        project_match: &[String],
        start_offset: u64,
    ) -> (Vec<SessionEntry>, u64);

    fn parse(&self, path: &Path, project_match: &[String]) -> Vec<SessionEntry> {
        self.parse_incremental(path, project_match, 0).0
    }
}

/// Look up a built-in adapter by format name.
pub fn adapter_for(format: &str) -> Result<Box<dyn SessionAdapter>, FoldError> {
    match format {
        "claude-code" => Ok(Box::new(ClaudeCodeAdapter)),
        "codex" => Ok(Box::new(CodexAdapter)),
        other => Err(FoldError::UnknownSessionFormat(other.to_string())),
    }
}

#[derive(Clone, Debug)]
struct Prompt {
    display: String,
    timestamp_ms: i64,
}

/// Groups prompts per session while preserving first-seen session order.
#[derive(Default)]
struct SessionGroups {
    order: Vec<String>,
    prompts: HashMap<String, Vec<Prompt>>,
}

impl SessionGroups {
    fn push(&mut self, session_id: &str, prompt: Prompt) {
        if !self.prompts.contains_key(session_id) {
            self.order.push(session_id.to_string());
        }
        self.prompts
            .entry(session_id.to_string())
            .or_default()
            .push(prompt);
    }

    fn retain_sessions(&mut self, keep: &HashSet<String>) {
        self.order.retain(|id| keep.contains(id));
        self.prompts.retain(|id, _| keep.contains(id));
    }

    fn session_ids(&self) -> HashSet<String> {
        self.order.iter().cloned().collect()
    }

    fn into_entries(self) -> Vec<SessionEntry> {
        let mut entries = Vec::new();
        let mut prompts_by_id = self.prompts;
        for session_id in self.order {
            let Some(mut prompts) = prompts_by_id.remove(&session_id) else {
                continue;
            };
            prompts.sort_by_key(|p| p.timestamp_ms);

            let mut filtered: Vec<Prompt> = Vec::new();
            let mut last_text: Option<String> = None;
            for prompt in prompts {
                let Some(normalized) = normalize_prompt_text(&prompt.display) else {
                    continue;
                };
                if last_text.as_deref() == Some(normalized.as_str()) {
                    continue;
                }
                last_text = Some(normalized.clone());
                filtered.push(Prompt {
                    display: normalized,
                    timestamp_ms: prompt.timestamp_ms,
                });
            }

            if filtered.is_empty() {
                continue;
            }

            let rendered = render_session_markdown(&filtered);
            let first_ts = filtered[0].timestamp_ms;
            let date = dates::from_unix_seconds(first_ts / 1000)
                .map(|dt| {
                    dt.format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_default()
                })
                .unwrap_or_default();

            entries.push(SessionEntry {
                session_id,
                date,
                chars: rendered.len(),
                prompt_count: filtered.len(),
                rendered,
            });
        }
        entries
    }
}

fn render_session_markdown(prompts: &[Prompt]) -> String {
    let mut lines = Vec::new();
    for prompt in prompts {
        let hhmm = dates::from_unix_seconds(prompt.timestamp_ms / 1000)
            .map(|dt| format!("{:02}:{:02}", dt.hour(), dt.minute()))
            .unwrap_or_else(|| "00:00".to_string());
        lines.push(format!("**[{hhmm}]** {}", prompt.display));
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Normalize prompt text for fold consumption: collapse to one line, drop
/// pure `[sm …]` telemetry, clip long relay blocks.
fn normalize_prompt_text(text: &str) -> Option<String> {
    let normalized = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if normalized.is_empty() {
        return None;
    }
    if SM_TELEMETRY_RE.is_match(&normalized) {
        return None;
    }
    if RELAY_RE.is_match(&normalized) && normalized.len() > RELAY_MAX_CHARS {
        let clipped: String = normalized.chars().take(RELAY_MAX_CHARS - 3).collect();
        let clipped = match clipped.rsplit_once(' ') {
            Some((head, _)) => head.to_string(),
            None => clipped,
        };
        return Some(format!("{clipped}..."));
    }
    Some(normalized)
}

fn clamp_offset(path: &Path, start_offset: u64) -> Option<u64> {
    let size = std::fs::metadata(path).ok()?.len();
    Some(if start_offset > size { 0 } else { start_offset })
}

fn read_jsonl_from<F: FnMut(Value)>(path: &Path, start_offset: u64, mut each: F) -> u64 {
    let Ok(mut file) = std::fs::File::open(path) else {
        return start_offset;
    };
    if file.seek(SeekFrom::Start(start_offset)).is_err() {
        return start_offset;
    }
    let mut reader = BufReader::new(&mut file);
    let mut consumed = start_offset;
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(n) => {
                consumed += n as u64;
                if let Ok(value) = serde_json::from_str::<Value>(line.trim()) {
                    each(value);
                }
            }
            Err(_) => break,
        }
    }
    consumed
}

/// Parse Claude Code's `~/.claude/history.jsonl`.
pub struct ClaudeCodeAdapter;

impl SessionAdapter for ClaudeCodeAdapter {
    fn parse_incremental(
        &self,
        path: &Path,
        project_match: &[String],
        start_offset: u64,
    ) -> (Vec<SessionEntry>, u64) {
        let Some(start_offset) = clamp_offset(path, start_offset) else {
            return (Vec::new(), start_offset);
        };

        let patterns: Vec<String> = project_match.iter().map(|p| p.to_lowercase()).collect();
        let mut groups = SessionGroups::default();

        let new_offset = read_jsonl_from(path, start_offset, |entry| {
            let project = entry
                .get("project")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            if !patterns.is_empty() && !patterns.iter().any(|p| project.contains(p)) {
                return;
            }

            let prompt = entry.get("display").and_then(Value::as_str).unwrap_or("");
            if prompt.starts_with('/') || prompt.len() < MIN_PROMPT_CHARS {
                return;
            }

            let session_id = entry
                .get("sessionId")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let timestamp_ms = entry
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            groups.push(
                session_id,
                Prompt {
                    display: prompt.to_string(),
                    timestamp_ms,
                },
            );
        });

        (groups.into_entries(), new_offset)
    }
}

/// Parse Codex CLI history with project matching via session logs.
pub struct CodexAdapter;

impl SessionAdapter for CodexAdapter {
    fn parse_incremental(
        &self,
        path: &Path,
        project_match: &[String],
        start_offset: u64,
    ) -> (Vec<SessionEntry>, u64) {
        let Some(start_offset) = clamp_offset(path, start_offset) else {
            return (Vec::new(), start_offset);
        };

        let mut groups = SessionGroups::default();
        let new_offset = read_jsonl_from(path, start_offset, |entry| {
            let Some(session_id) = entry.get("session_id").and_then(Value::as_str) else {
                return;
            };
            if session_id.is_empty() {
                return;
            }
            let Some(text) = entry.get("text").and_then(Value::as_str) else {
                return;
            };
            let text = text.trim();
            if text.is_empty() || text.starts_with('/') || text.len() < MIN_PROMPT_CHARS {
                return;
            }
            let Some(timestamp_ms) = codex_ts_to_ms(entry.get("ts")) else {
                return;
            };
            groups.push(
                session_id,
                Prompt {
                    display: text.to_string(),
                    timestamp_ms,
                },
            );
        });

        if !project_match.is_empty() && !groups.order.is_empty() {
            let sessions_root = path.parent().map(|p| p.join("sessions"));
            let cwds = sessions_root
                .map(|root| load_codex_session_cwds(&root, &groups.session_ids()))
                .unwrap_or_default();
            let patterns: Vec<String> = project_match.iter().map(|p| p.to_lowercase()).collect();
            let keep: HashSet<String> = groups
                .order
                .iter()
                .filter(|id| {
                    cwds.get(*id).is_some_and(|session_cwds| {
                        session_cwds
                            .iter()
                            .any(|cwd| patterns.iter().any(|p| cwd.contains(p)))
                    })
                })
                .cloned()
                .collect();
            groups.retain_sessions(&keep);
        }

        (groups.into_entries(), new_offset)
    }
}

/// Normalize Codex `ts` values to epoch milliseconds. Codex history uses
/// epoch seconds today; millisecond inputs are tolerated.
fn codex_ts_to_ms(raw: Option<&Value>) -> Option<i64> {
    let ts = raw?.as_f64()?;
    if ts >= 10_000_000_000.0 {
        Some(ts as i64)
    } else {
        Some((ts * 1000.0) as i64)
    }
}

/// Map session_id → observed cwd values from Codex session logs.
fn load_codex_session_cwds(
    sessions_root: &Path,
    session_ids: &HashSet<String>,
) -> HashMap<String, HashSet<String>> {
    let mut out: HashMap<String, HashSet<String>> = HashMap::new();
    if session_ids.is_empty() {
        return out;
    }

    for session_file in walk_jsonl_files(sessions_root) {
        let sid_from_name = session_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .and_then(|name| {
                SESSION_FILE_ID_RE
                    .captures(&name)
                    .map(|caps| caps[1].to_string())
            });
        if let Some(sid) = &sid_from_name {
            if !session_ids.contains(sid) {
                continue;
            }
        }

        let mut current_sid = sid_from_name;
        read_jsonl_from(&session_file, 0, |event| {
            let payload = event.get("payload").cloned().unwrap_or(Value::Null);
            if !payload.is_object() {
                return;
            }
            match event.get("type").and_then(Value::as_str) {
                Some("session_meta") => {
                    if let Some(sid) = payload.get("id").and_then(Value::as_str) {
                        if !sid.is_empty() {
                            current_sid = Some(sid.to_string());
                        }
                    }
                    record_cwd(&mut out, current_sid.as_deref(), payload.get("cwd"));
                }
                Some("turn_context") => {
                    record_cwd(&mut out, current_sid.as_deref(), payload.get("cwd"));
                }
                Some("response_item") => {
                    if payload.get("type").and_then(Value::as_str) == Some("message") {
                        let cwd = payload
                            .get("content")
                            .and_then(Value::as_array)
                            .and_then(|parts| {
                                parts.iter().find_map(|part| {
                                    let text = part.get("text").and_then(Value::as_str)?;
                                    CWD_TAG_RE
                                        .captures(text)
                                        .map(|caps| caps[1].trim().to_string())
                                })
                            });
                        if let Some(cwd) = cwd {
                            record_cwd(
                                &mut out,
                                current_sid.as_deref(),
                                Some(&Value::String(cwd)),
                            );
                        }
                    }
                }
                _ => {}
            }
        });
    }

    out.retain(|sid, cwds| session_ids.contains(sid) && !cwds.is_empty());
    out
}

fn record_cwd(
    out: &mut HashMap<String, HashSet<String>>,
    session_id: Option<&str>,
    cwd: Option<&Value>,
) {
    let Some(session_id) = session_id else { return };
    let Some(cwd) = cwd.and_then(Value::as_str) else {
        return;
    };
    if session_id.is_empty() || cwd.is_empty() {
        return;
    }
    out.entry(session_id.to_string())
        .or_default()
        .insert(cwd.to_lowercase());
}

fn walk_jsonl_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(test_name: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = base.join(format!("engram_sessions_{test_name}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn line(project: &str, display: &str, session: &str, ts_ms: i64) -> String {
        serde_json::json!({
            "project": project,
            "display": display,
            "sessionId": session,
            "timestamp": ts_ms,
        })
        .to_string()
    }

    #[test]
    fn claude_code_groups_and_filters() {
        let dir = temp_dir("claude_groups");
        let history = dir.join("history.jsonl");
        let contents = [
            line("/home/u/proj-a", "Please refactor the order book module now", "s1", 1_700_000_000_000),
            line("/home/u/proj-a", "/compact", "s1", 1_700_000_060_000),
            line("/home/u/proj-a", "short", "s1", 1_700_000_120_000),
            line("/home/u/other", "This prompt belongs to another project entirely", "s2", 1_700_000_180_000),
            line("/home/u/proj-a", "Add a regression test for the drain predicate", "s3", 1_700_000_240_000),
            "not json at all".to_string(),
        ]
        .join("\n");
        std::fs::write(&history, contents + "\n").expect("write history");

        let entries = ClaudeCodeAdapter.parse(&history, &["proj-a".to_string()]);
        let ids: Vec<&str> = entries.iter().map(|e| e.session_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s3"]);
        assert_eq!(entries[0].prompt_count, 1);
        assert!(entries[0].rendered.contains("refactor the order book"));
        assert!(entries[0].date.starts_with("2023-11-14"));
    }

    #[test]
    fn incremental_parse_resumes_from_offset() {
        let dir = temp_dir("incremental");
        let history = dir.join("history.jsonl");
        let first = line("p", "An early prompt with plenty of characters", "s1", 1_700_000_000_000);
        std::fs::write(&history, format!("{first}\n")).expect("write");

        let (entries, offset) = ClaudeCodeAdapter.parse_incremental(&history, &[], 0);
        assert_eq!(entries.len(), 1);

        let second = line("p", "A later prompt appended after the bookmark", "s2", 1_700_000_100_000);
        let mut full = std::fs::read_to_string(&history).expect("read");
        full.push_str(&format!("{second}\n"));
        std::fs::write(&history, full).expect("append");

        let (entries, new_offset) = ClaudeCodeAdapter.parse_incremental(&history, &[], offset);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, "s2");
        assert!(new_offset > offset);
    }

    #[test]
    fn truncated_file_resets_offset() {
        let dir = temp_dir("truncated");
        let history = dir.join("history.jsonl");
        std::fs::write(
            &history,
            format!("{}\n", line("p", "Prompt that survives a history truncation", "s1", 1_700_000_000_000)),
        )
        .expect("write");

        // Bookmark beyond the (now shorter) file falls back to a full parse.
        let (entries, _) = ClaudeCodeAdapter.parse_incremental(&history, &[], 1_000_000);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn consecutive_duplicate_prompts_collapse() {
        let dir = temp_dir("dedup");
        let history = dir.join("history.jsonl");
        let contents = [
            line("p", "Run the chunker against the January backlog", "s1", 1),
            line("p", "Run the chunker against the January backlog", "s1", 2),
            line("p", "Now lint the result and report violations", "s1", 3),
        ]
        .join("\n");
        std::fs::write(&history, contents + "\n").expect("write");

        let entries = ClaudeCodeAdapter.parse(&history, &[]);
        assert_eq!(entries[0].prompt_count, 2);
    }

    #[test]
    fn telemetry_lines_are_dropped() {
        assert_eq!(normalize_prompt_text("[sm trace] ping pong telemetry"), None);
        assert_eq!(
            normalize_prompt_text("hello\n  world  \n"),
            Some("hello world".to_string())
        );
    }

    #[test]
    fn relay_blocks_are_clipped() {
        let long_tail = "x".repeat(400);
        let text = format!("[Input from: somewhere] {long_tail}");
        let normalized = normalize_prompt_text(&text).expect("kept");
        assert!(normalized.len() <= RELAY_MAX_CHARS);
        assert!(normalized.ends_with("..."));
    }

    #[test]
    fn codex_seconds_and_millis_both_normalize() {
        assert_eq!(
            codex_ts_to_ms(Some(&serde_json::json!(1_700_000_000))),
            Some(1_700_000_000_000)
        );
        assert_eq!(
            codex_ts_to_ms(Some(&serde_json::json!(1_700_000_000_000_i64))),
            Some(1_700_000_000_000)
        );
        assert_eq!(codex_ts_to_ms(Some(&serde_json::json!("nan"))), None);
        assert_eq!(codex_ts_to_ms(None), None);
    }

    #[test]
    fn codex_project_match_uses_session_logs() {
        let dir = temp_dir("codex_match");
        let history = dir.join("history.jsonl");
        let sessions = dir.join("sessions");
        std::fs::create_dir_all(&sessions).expect("mkdir");

        let sid = "0123abcd-0000-4000-8000-000000000001";
        let other = "0123abcd-0000-4000-8000-000000000002";
        let contents = [
            serde_json::json!({"session_id": sid, "text": "Wire the drift scanner into the loop", "ts": 1_700_000_000}).to_string(),
            serde_json::json!({"session_id": other, "text": "Unrelated prompt from some other repo", "ts": 1_700_000_100}).to_string(),
        ]
        .join("\n");
        std::fs::write(&history, contents + "\n").expect("write history");

        let meta = serde_json::json!({
            "type": "session_meta",
            "payload": {"id": sid, "cwd": "/home/u/Engram-Project"}
        })
        .to_string();
        std::fs::write(sessions.join(format!("{sid}.jsonl")), meta + "\n").expect("write log");

        let entries = CodexAdapter.parse(&history, &["engram-project".to_string()]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].session_id, sid);
    }

    #[test]
    fn unknown_format_is_an_error() {
        assert!(adapter_for("claude-code").is_ok());
        assert!(adapter_for("codex").is_ok());
        assert!(matches!(
            adapter_for("copilot"),
            Err(FoldError::UnknownSessionFormat(_))
        ));
    }
}
