#![forbid(unsafe_code)]

//! The active-chunk lock: `.engram/active_chunk.yaml`.
//!
//! Present iff a chunk has been produced and not yet terminally processed.
//! It is a file rather than an in-memory mutex because the process is
//! restartable and one-shot CLI commands run between server runs. The lock
//! is written only after the chunk artifacts are durably on disk, and
//! cleared only when the dispatch reaches a terminal state (or explicitly by
//! the operator).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use tracing::info;

use crate::git;
use crate::FoldError;

pub const LOCK_FILE: &str = "active_chunk.yaml";

/// How many recent commits the auto-clear heuristic inspects.
const AUTO_CLEAR_LOG_DEPTH: usize = 200;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActiveChunkLock {
    pub chunk_id: i64,
    pub chunk_type: String,
    pub input_path: String,
    pub prompt_path: String,
    pub created_at: String,
}

pub fn lock_path(engram_dir: &Path) -> PathBuf {
    engram_dir.join(LOCK_FILE)
}

impl ActiveChunkLock {
    pub fn read(engram_dir: &Path) -> Result<Option<Self>, FoldError> {
        let path = lock_path(engram_dir);
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        let lock = serde_yaml::from_str(&text)?;
        Ok(Some(lock))
    }

    pub fn write(&self, engram_dir: &Path) -> Result<(), FoldError> {
        let text = serde_yaml::to_string(self)?;
        std::fs::write(lock_path(engram_dir), text)?;
        Ok(())
    }

    pub fn clear(engram_dir: &Path) -> Result<bool, FoldError> {
        let path = lock_path(engram_dir);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    fn created_epoch(&self) -> Option<i64> {
        time::OffsetDateTime::parse(&self.created_at, &Rfc3339)
            .ok()
            .map(|dt| dt.unix_timestamp())
    }

    /// Whether a commit subject marks this chunk as processed.
    ///
    /// Accepts `Knowledge fold: chunk 7` (zero-padding and `chunk_7`
    /// tolerated) and the shorter `Fold chunk 7` form, case-insensitively.
    pub fn subject_matches(&self, subject: &str) -> bool {
        let id = self.chunk_id;
        let patterns = [
            format!(r"(?i)^Knowledge fold:\s*chunk[_ ]0*{id}\b"),
            format!(r"(?i)^Fold chunk[_ ]0*{id}\b"),
        ];
        patterns.iter().any(|pattern| {
            regex::Regex::new(pattern)
                .map(|re| re.is_match(subject))
                .unwrap_or(false)
        })
    }
}

/// Best-effort auto-clear: if a commit authored at or after the lock's
/// creation carries a `Knowledge fold: chunk <id>` subject, the chunk was
/// processed and the lock is released. Gating on the creation time prevents
/// historical subjects from an earlier `.engram/` generation (where chunk
/// ids restarted) from releasing a fresh lock.
pub fn auto_clear_if_processed(
    engram_dir: &Path,
    project_root: &Path,
) -> Result<bool, FoldError> {
    let Some(lock) = ActiveChunkLock::read(engram_dir)? else {
        return Ok(false);
    };
    let Some(created_epoch) = lock.created_epoch() else {
        return Ok(false);
    };

    let processed = git::recent_subjects(project_root, AUTO_CLEAR_LOG_DEPTH)
        .iter()
        .filter(|(ts, _)| *ts >= created_epoch)
        .any(|(_, subject)| lock.subject_matches(subject));

    if processed {
        info!(chunk_id = lock.chunk_id, "auto-clearing processed active chunk");
        ActiveChunkLock::clear(engram_dir)?;
        return Ok(true);
    }
    Ok(false)
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
        let dir = base.join(format!("engram_lock_{test_name}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn lock(chunk_id: i64) -> ActiveChunkLock {
        ActiveChunkLock {
            chunk_id,
            chunk_type: "fold".to_string(),
            input_path: format!(".engram/chunks/chunk_{chunk_id:03}_input.md"),
            prompt_path: format!(".engram/chunks/chunk_{chunk_id:03}_prompt.txt"),
            created_at: "2026-01-15T10:00:00Z".to_string(),
        }
    }

    #[test]
    fn write_read_clear_round_trip() {
        let dir = temp_dir("round_trip");
        assert!(ActiveChunkLock::read(&dir).expect("read").is_none());

        lock(7).write(&dir).expect("write");
        let read = ActiveChunkLock::read(&dir).expect("read").expect("present");
        assert_eq!(read.chunk_id, 7);

        assert!(ActiveChunkLock::clear(&dir).expect("clear"));
        assert!(!ActiveChunkLock::clear(&dir).expect("second clear is a no-op"));
        assert!(ActiveChunkLock::read(&dir).expect("read").is_none());
    }

    #[test]
    fn subject_matching_accepts_common_forms() {
        let lock = lock(7);
        for subject in [
            "Knowledge fold: chunk 7",
            "Knowledge fold: chunk 007",
            "Knowledge fold: chunk_7",
            "knowledge fold: chunk_007 plus trailing words",
            "Fold chunk 7",
        ] {
            assert!(lock.subject_matches(subject), "should match: {subject}");
        }
        for subject in [
            "Knowledge fold: chunk 17",
            "Unrelated commit about chunk 7",
            "Knowledge fold: chunk 70",
        ] {
            assert!(!lock.subject_matches(subject), "should not match: {subject}");
        }
    }
}
