#![forbid(unsafe_code)]

//! The ingestion-to-dispatch pipeline: source adapters, chronological queue
//! building, drift scanning, identifier pre-assignment, and the
//! chunker/scheduler that assembles the next fold or triage chunk.

pub mod chunker;
pub mod drift;
pub mod git;
pub mod ids;
pub mod lock;
pub mod manifest;
pub mod prompt;
pub mod queue;
pub mod sessions;
pub mod sources;

pub use chunker::{ChunkResult, compute_budget, next_chunk};
pub use drift::{DriftReport, scan_drift};
pub use lock::ActiveChunkLock;
pub use queue::{QueueEntry, build_queue, queue_is_empty};

use engram_storage::StoreError;
use std::path::PathBuf;

/// Chunk types the scheduler can produce, in drift priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkType {
    Fold,
    ConceptTriage,
    ContestedReview,
    StaleUnverified,
    WorkflowSynthesis,
}

impl ChunkType {
    pub const DRIFT_PRIORITY: [ChunkType; 4] = [
        Self::ConceptTriage,
        Self::ContestedReview,
        Self::StaleUnverified,
        Self::WorkflowSynthesis,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fold => "fold",
            Self::ConceptTriage => "concept_triage",
            Self::ContestedReview => "contested_review",
            Self::StaleUnverified => "stale_unverified",
            Self::WorkflowSynthesis => "workflow_synthesis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fold" => Some(Self::Fold),
            "concept_triage" => Some(Self::ConceptTriage),
            "contested_review" => Some(Self::ContestedReview),
            "stale_unverified" => Some(Self::StaleUnverified),
            "workflow_synthesis" => Some(Self::WorkflowSynthesis),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum FoldError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Yaml(serde_yaml::Error),
    Store(StoreError),
    /// `start_date` was not a strict `YYYY-MM-DD` day.
    InvalidStartDate(String),
    /// No queue file on disk; `build-queue` has not run.
    QueueMissing,
    /// Queue file present but drained.
    QueueEmpty,
    /// An active chunk exists and has not been finalized.
    LockHeld { chunk_id: i64, input_path: String },
    UnknownSessionFormat(String),
    IssueRefresh(String),
}

impl std::fmt::Display for FoldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Json(err) => write!(f, "json: {err}"),
            Self::Yaml(err) => write!(f, "yaml: {err}"),
            Self::Store(err) => write!(f, "store: {err}"),
            Self::InvalidStartDate(input) => {
                write!(f, "invalid start date '{input}': expected YYYY-MM-DD")
            }
            Self::QueueMissing => write!(f, "no queue found; run 'engram build-queue' first"),
            Self::QueueEmpty => write!(f, "queue is empty; all chunks have been produced"),
            Self::LockHeld {
                chunk_id,
                input_path,
            } => write!(
                f,
                "active chunk {chunk_id} not yet processed (input: {input_path}); \
                 run 'engram clear-active-chunk' to abandon it"
            ),
            Self::UnknownSessionFormat(format) => {
                write!(f, "unknown session format '{format}'; built-in: claude-code, codex")
            }
            Self::IssueRefresh(message) => write!(f, "issue refresh failed: {message}"),
        }
    }
}

impl std::error::Error for FoldError {}

impl From<std::io::Error> for FoldError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for FoldError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<serde_yaml::Error> for FoldError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

impl From<StoreError> for FoldError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// `.engram/` directory for a project root.
pub fn engram_dir(project_root: &std::path::Path) -> PathBuf {
    project_root.join(".engram")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_type_round_trips() {
        for ty in [
            ChunkType::Fold,
            ChunkType::ConceptTriage,
            ChunkType::ContestedReview,
            ChunkType::StaleUnverified,
            ChunkType::WorkflowSynthesis,
        ] {
            assert_eq!(ChunkType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(ChunkType::parse("epistemic_audit"), None);
    }

    #[test]
    fn lock_held_message_names_recovery_command() {
        let err = FoldError::LockHeld {
            chunk_id: 7,
            input_path: "chunks/chunk_007_input.md".to_string(),
        };
        assert!(err.to_string().contains("clear-active-chunk"));
    }
}
