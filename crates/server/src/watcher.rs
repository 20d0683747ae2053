#![forbid(unsafe_code)]

//! Polling event sources for the server loop.
//!
//! Three pollers, all synchronous and cheap enough to run every tick:
//! a doc scanner (mtime/size over the configured source dirs), a git poller
//! (`rev-parse HEAD` against a bookmark), and a session poller (history-file
//! mtime + byte offset). Each returns plain change records; the loop feeds
//! them into the context buffer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use engram_fold::git;
use engram_fold::sessions::adapter_for;
use engram_core::Config;

/// A change record destined for the context buffer.
#[derive(Clone, Debug)]
pub struct ChangeItem {
    pub path: String,
    pub kind: engram_storage::ItemKind,
    pub chars: i64,
    pub date: Option<String>,
    pub metadata: Option<String>,
}

const DOC_EXTENSIONS: [&str; 5] = ["md", "txt", "json", "yaml", "yml"];

/// Scans configured source directories for created/modified files.
///
/// The first poll seeds the baseline without emitting events, mirroring an
/// event-based watcher that only reports changes after it starts.
pub struct DocPoller {
    project_root: PathBuf,
    watch_dirs: Vec<PathBuf>,
    issues_dir: PathBuf,
    seen: HashMap<PathBuf, (i64, u64)>,
    primed: bool,
}

impl DocPoller {
    pub fn new(config: &Config, project_root: &Path) -> Self {
        let mut watch_dirs: Vec<PathBuf> = config
            .sources
            .docs
            .iter()
            .map(|dir| project_root.join(dir))
            .collect();
        let issues_dir = project_root.join(&config.sources.issues);
        watch_dirs.push(issues_dir.clone());
        Self {
            project_root: project_root.to_path_buf(),
            watch_dirs,
            issues_dir,
            seen: HashMap::new(),
            primed: false,
        }
    }

    pub fn poll(&mut self) -> Vec<ChangeItem> {
        let mut changes = Vec::new();
        let primed = self.primed;

        for dir in self.watch_dirs.clone() {
            self.scan_dir(&dir, primed, &mut changes);
        }

        self.primed = true;
        changes
    }

    fn scan_dir(&mut self, dir: &Path, primed: bool, changes: &mut Vec<ChangeItem>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with('.'))
            {
                continue;
            }
            if path.is_dir() {
                self.scan_dir(&path, primed, changes);
                continue;
            }
            let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
                continue;
            };
            if !DOC_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            let mtime = meta
                .modified()
                .ok()
                .and_then(|st| st.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            let size = meta.len();

            let changed = self.seen.get(&path) != Some(&(mtime, size));
            self.seen.insert(path.clone(), (mtime, size));
            if !changed || !primed {
                continue;
            }

            let Ok(rel) = path.strip_prefix(&self.project_root) else {
                continue;
            };
            let kind = if ext == "json" && path.starts_with(&self.issues_dir) {
                engram_storage::ItemKind::Issue
            } else {
                engram_storage::ItemKind::Doc
            };
            changes.push(ChangeItem {
                path: rel.to_string_lossy().to_string(),
                kind,
                chars: size as i64,
                date: None,
                metadata: None,
            });
        }
    }
}

/// Detects new commits by comparing HEAD against a persisted bookmark.
pub struct GitPoller {
    project_root: PathBuf,
    source_dirs: Vec<String>,
    last_commit: Option<String>,
}

impl GitPoller {
    pub fn new(config: &Config, project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            source_dirs: config.sources.docs.clone(),
            last_commit: None,
        }
    }

    pub fn set_last_commit(&mut self, commit: Option<String>) {
        self.last_commit = commit;
    }

    pub fn last_commit(&self) -> Option<&str> {
        self.last_commit.as_deref()
    }

    /// Returns change items for files touched since the bookmark. The first
    /// poll only records HEAD — history is not backfilled.
    pub fn poll(&mut self) -> Vec<ChangeItem> {
        let Some(head) = git::head_commit(&self.project_root) else {
            return Vec::new();
        };

        let Some(old) = self.last_commit.clone() else {
            self.last_commit = Some(head);
            return Vec::new();
        };
        if old == head {
            return Vec::new();
        }

        let new_commits = git::commits_between(&self.project_root, &old, &head);
        self.last_commit = Some(head.clone());
        if new_commits.is_empty() {
            return Vec::new();
        }
        info!(count = new_commits.len(), "git: new commits");

        git::changed_files(&self.project_root, &old, &head)
            .into_iter()
            .filter(|file| {
                self.source_dirs.is_empty()
                    || self.source_dirs.iter().any(|dir| file.starts_with(dir.as_str()))
            })
            .map(|file| {
                let chars = std::fs::metadata(self.project_root.join(&file))
                    .map(|meta| meta.len() as i64)
                    .unwrap_or(0);
                ChangeItem {
                    path: file,
                    kind: engram_storage::ItemKind::Doc,
                    chars,
                    date: None,
                    metadata: None,
                }
            })
            .collect()
    }
}

/// Watches the session history file via mtime/size and parses new entries
/// incrementally from a persisted byte offset.
pub struct SessionPoller {
    project_root: PathBuf,
    history_path: PathBuf,
    format: String,
    project_match: Vec<String>,
    last_mtime: Option<i64>,
    last_offset: u64,
    known_prompt_counts: HashMap<String, usize>,
}

impl SessionPoller {
    pub fn new(config: &Config, project_root: &Path) -> Self {
        let sessions = &config.sources.sessions;
        Self {
            project_root: project_root.to_path_buf(),
            history_path: expand_tilde(&sessions.path),
            format: sessions.format.clone(),
            project_match: sessions.project_match.clone(),
            last_mtime: None,
            last_offset: 0,
            known_prompt_counts: HashMap::new(),
        }
    }

    pub fn set_bookmarks(&mut self, mtime: Option<i64>, offset: i64) {
        self.last_mtime = mtime;
        self.last_offset = offset.max(0) as u64;
    }

    pub fn bookmarks(&self) -> (Option<i64>, i64) {
        (self.last_mtime, self.last_offset as i64)
    }

    pub fn poll(&mut self) -> Vec<ChangeItem> {
        let Ok(meta) = std::fs::metadata(&self.history_path) else {
            return Vec::new();
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|st| st.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let size = meta.len();

        let changed = match self.last_mtime {
            None => true,
            Some(last) => mtime > last || size < self.last_offset,
        };
        if !changed {
            return Vec::new();
        }

        let adapter = match adapter_for(&self.format) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(%err, "session polling disabled");
                self.last_mtime = Some(mtime);
                self.last_offset = size;
                return Vec::new();
            }
        };

        let start_offset = if size < self.last_offset { 0 } else { self.last_offset };
        let (entries, new_offset) =
            adapter.parse_incremental(&self.history_path, &self.project_match, start_offset);

        let sessions_dir = self.project_root.join(".engram").join("sessions");
        let mut items = Vec::new();
        for entry in entries {
            let (rel_path, chars) = match self.write_session_file(
                &sessions_dir,
                &entry.session_id,
                &entry.rendered,
                start_offset == 0,
            ) {
                Ok(written) => written,
                Err(err) => {
                    warn!(%err, session_id = %entry.session_id, "could not write session snapshot");
                    continue;
                }
            };

            let known = self
                .known_prompt_counts
                .get(&entry.session_id)
                .copied()
                .unwrap_or(0);
            let total = if start_offset == 0 {
                entry.prompt_count
            } else {
                known + entry.prompt_count
            };
            self.known_prompt_counts
                .insert(entry.session_id.clone(), total);

            items.push(ChangeItem {
                path: rel_path,
                kind: engram_storage::ItemKind::Prompts,
                chars,
                date: Some(entry.date.clone()),
                metadata: Some(format!("{{\"prompt_count\":{}}}", entry.prompt_count)),
            });
        }

        self.last_mtime = Some(mtime);
        self.last_offset = new_offset;
        items
    }

    /// Write (or append) the rendered session markdown under
    /// `.engram/sessions/`. A full re-parse overwrites; incremental parses
    /// append to the running snapshot.
    fn write_session_file(
        &self,
        sessions_dir: &Path,
        session_id: &str,
        rendered: &str,
        reset: bool,
    ) -> std::io::Result<(String, i64)> {
        std::fs::create_dir_all(sessions_dir)?;
        let session_file = sessions_dir.join(format!("{session_id}.md"));

        if reset || !session_file.exists() {
            std::fs::write(&session_file, rendered)?;
        } else {
            let mut existing = std::fs::read_to_string(&session_file)?;
            if !existing.is_empty() && !existing.ends_with('\n') {
                existing.push('\n');
            }
            existing.push_str(rendered);
            std::fs::write(&session_file, existing)?;
        }

        let chars = std::fs::metadata(&session_file)
            .map(|meta| meta.len() as i64)
            .unwrap_or(rendered.len() as i64);
        let rel = format!(".engram/sessions/{session_id}.md");
        Ok((rel, chars))
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
