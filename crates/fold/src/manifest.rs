#![forbid(unsafe_code)]

//! The append-only chunks manifest: `.engram/chunks_manifest.yaml`.
//!
//! One entry per chunk ever produced, keyed by chunk id. Chunk ids are
//! allocated as `max(recorded ids) + 1` and the manifest is never pruned, so
//! ids are never reused even if chunk files are deleted. Synthesis entries
//! additionally record the workflow registry hash at generation time; that
//! hash is the cooldown key suppressing re-issue while the registry is
//! unchanged.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{ChunkType, FoldError};

pub const MANIFEST_FILE: &str = "chunks_manifest.yaml";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: i64,
    #[serde(rename = "type")]
    pub chunk_type: String,
    pub input_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_registry_hash: Option<String>,
}

pub fn manifest_path(engram_dir: &Path) -> PathBuf {
    engram_dir.join(MANIFEST_FILE)
}

/// Read all manifest entries. A missing file is an empty manifest; an
/// unparseable file is treated as empty with a warning, never an error.
pub fn read_manifest(path: &Path) -> Vec<ManifestEntry> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    match serde_yaml::from_str::<Vec<ManifestEntry>>(&text) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "could not parse chunks manifest");
            Vec::new()
        }
    }
}

/// Append one entry, preserving everything already recorded.
pub fn append_manifest(path: &Path, entry: ManifestEntry) -> Result<(), FoldError> {
    let mut entries = read_manifest(path);
    entries.push(entry);
    let text = serde_yaml::to_string(&entries)?;
    std::fs::write(path, text)?;
    Ok(())
}

/// Next chunk id: one past the highest id ever recorded. Never reused.
pub fn next_chunk_id(path: &Path) -> i64 {
    read_manifest(path)
        .iter()
        .map(|entry| entry.id)
        .max()
        .unwrap_or(0)
        + 1
}

/// The most recent `workflow_synthesis` entry, if any.
pub fn last_synthesis_entry(entries: &[ManifestEntry]) -> Option<&ManifestEntry> {
    entries
        .iter()
        .filter(|entry| entry.chunk_type == ChunkType::WorkflowSynthesis.as_str())
        .max_by_key(|entry| entry.id)
}

/// Cooldown check for workflow synthesis: suppressed while the registry hash
/// matches the last synthesis entry and that entry is within the chunk-id
/// cooldown window of the id about to be issued.
pub fn synthesis_on_cooldown(
    entries: &[ManifestEntry],
    current_registry_hash: Option<&str>,
    next_id: i64,
    cooldown_chunks: i64,
) -> bool {
    let Some(last) = last_synthesis_entry(entries) else {
        return false;
    };
    let (Some(recorded), Some(current)) =
        (last.workflow_registry_hash.as_deref(), current_registry_hash)
    else {
        return false;
    };
    recorded == current && next_id - last.id <= cooldown_chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_manifest(test_name: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = base.join(format!("engram_manifest_{test_name}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        manifest_path(&dir)
    }

    fn fold_entry(id: i64) -> ManifestEntry {
        ManifestEntry {
            id,
            chunk_type: "fold".to_string(),
            input_file: format!("chunk_{id:03}_input.md"),
            date_range: Some("2026-01-01 to 2026-01-31".to_string()),
            items: Some(4),
            chars: Some(1000),
            entries: None,
            workflow_registry_hash: None,
        }
    }

    fn synthesis_entry(id: i64, hash: &str) -> ManifestEntry {
        ManifestEntry {
            id,
            chunk_type: "workflow_synthesis".to_string(),
            input_file: format!("chunk_{id:03}_input.md"),
            date_range: None,
            items: None,
            chars: None,
            entries: Some(5),
            workflow_registry_hash: Some(hash.to_string()),
        }
    }

    #[test]
    fn append_and_read_round_trip() {
        let path = temp_manifest("round_trip");
        append_manifest(&path, fold_entry(1)).expect("append 1");
        append_manifest(&path, synthesis_entry(2, "abc")).expect("append 2");

        let entries = read_manifest(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].workflow_registry_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn chunk_ids_never_regress() {
        let path = temp_manifest("never_regress");
        assert_eq!(next_chunk_id(&path), 1);
        append_manifest(&path, fold_entry(1)).expect("append");
        append_manifest(&path, fold_entry(2)).expect("append");
        assert_eq!(next_chunk_id(&path), 3);
        // Ids come from the manifest, not from files on disk — deleting chunk
        // artifacts cannot cause reuse.
    }

    #[test]
    fn cooldown_requires_matching_hash_and_window() {
        let entries = vec![fold_entry(1), synthesis_entry(2, "aaa"), fold_entry(3)];

        // Same hash, within window: suppressed.
        assert!(synthesis_on_cooldown(&entries, Some("aaa"), 4, 3));
        // Same hash, window elapsed: allowed again.
        assert!(!synthesis_on_cooldown(&entries, Some("aaa"), 6, 3));
        // Registry changed: allowed immediately.
        assert!(!synthesis_on_cooldown(&entries, Some("bbb"), 4, 3));
        // No registry on disk: nothing to compare.
        assert!(!synthesis_on_cooldown(&entries, None, 4, 3));
        // No prior synthesis entry at all.
        assert!(!synthesis_on_cooldown(&[fold_entry(1)], Some("aaa"), 2, 3));
    }
}
