#![forbid(unsafe_code)]

//! Drift scanning: where have the living docs fallen out of agreement with
//! reality?
//!
//! Four metrics, evaluated in fixed priority order: orphaned concepts,
//! long-contested claims, stale unverified claims, and workflow repetition.
//! When the fold-from marker is set, orphan existence checks resolve against
//! the repository state at that date (`git ls-tree` of the nearest commit)
//! instead of today's filesystem.

use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use time::OffsetDateTime;
use tracing::warn;

use crate::ChunkType;
use crate::git;
use engram_core::dates;
use engram_core::parse::{extract_id, is_stub, parse_sections};
use engram_core::{Config, DocPaths};

static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2})").expect("ISO_DATE_RE should compile"));
static EVIDENCE_COMMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Evidence@([0-9a-fA-F]{7,40})").expect("EVIDENCE_COMMIT_RE should compile")
});
/// Field-header forms, tried in order: colon inside bold (`**History:**`),
/// colon outside bold (`**History**:`), plain (`History:`).
static FIELD_HEADER_RES: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"^\*\*([A-Za-z][A-Za-z _/-]*):\*\*\s*(.*)$")
            .expect("bold-inner field regex should compile"),
        Regex::new(r"^\*\*([A-Za-z][A-Za-z _/-]*)\*\*:\s*(.*)$")
            .expect("bold-outer field regex should compile"),
        Regex::new(r"^([A-Za-z][A-Za-z _/-]*):\s*(.*)$")
            .expect("plain field regex should compile"),
    ]
});

fn parse_field_header(normalized: &str) -> Option<(String, String)> {
    FIELD_HEADER_RES.iter().find_map(|re| {
        re.captures(normalized)
            .map(|caps| (caps[1].trim().to_lowercase(), caps[2].trim().to_string()))
    })
}

/// Recognized epistemic field headers; history extraction stops at the next
/// one of these so free-form history lines are not misclassified.
const EPISTEMIC_FIELD_NAMES: [&str; 6] = [
    "current position",
    "evidence",
    "history",
    "agent guidance",
    "corrected by",
    "superseded by",
];

#[derive(Clone, Debug)]
pub struct OrphanedConcept {
    pub name: String,
    pub id: Option<String>,
    pub paths: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct AgedClaim {
    pub name: String,
    pub id: Option<String>,
    pub days_old: i64,
    pub last_date: String,
}

#[derive(Clone, Debug)]
pub struct CurrentWorkflow {
    pub name: String,
    pub id: Option<String>,
}

/// Results from scanning living docs for drift conditions.
#[derive(Clone, Debug, Default)]
pub struct DriftReport {
    pub orphaned_concepts: Vec<OrphanedConcept>,
    pub contested_claims: Vec<AgedClaim>,
    pub stale_unverified: Vec<AgedClaim>,
    pub workflow_repetitions: Vec<CurrentWorkflow>,
    /// Resolved temporal reference commit, when the fold-from marker is set
    /// and resolution succeeded.
    pub ref_commit: Option<String>,
}

impl DriftReport {
    /// Whether one drift type exceeds its configured threshold.
    pub fn exceeds(&self, config: &Config, chunk_type: ChunkType) -> bool {
        let thresholds = &config.thresholds;
        match chunk_type {
            ChunkType::ConceptTriage => self.orphaned_concepts.len() > thresholds.orphan_triage,
            ChunkType::ContestedReview => {
                self.contested_claims.len() > thresholds.contested_review_threshold
            }
            ChunkType::StaleUnverified => {
                self.stale_unverified.len() > thresholds.stale_unverified_threshold
            }
            ChunkType::WorkflowSynthesis => {
                self.workflow_repetitions.len() > thresholds.workflow_repetition
            }
            ChunkType::Fold => false,
        }
    }

    /// The highest-priority drift type exceeding its threshold, if any.
    pub fn triggered(&self, config: &Config) -> Option<ChunkType> {
        ChunkType::DRIFT_PRIORITY
            .into_iter()
            .find(|chunk_type| self.exceeds(config, *chunk_type))
    }

    pub fn entry_count(&self, chunk_type: ChunkType) -> usize {
        match chunk_type {
            ChunkType::ConceptTriage => self.orphaned_concepts.len(),
            ChunkType::ContestedReview => self.contested_claims.len(),
            ChunkType::StaleUnverified => self.stale_unverified.len(),
            ChunkType::WorkflowSynthesis => self.workflow_repetitions.len(),
            ChunkType::Fold => 0,
        }
    }
}

/// Scan all living docs for drift conditions.
///
/// When `fold_from` is set, orphan detection checks file existence at the git
/// commit nearest to that date. Failed resolution logs a warning and falls
/// back to the current filesystem.
pub fn scan_drift(config: &Config, project_root: &Path, fold_from: Option<&str>) -> DriftReport {
    let doc_paths = config.doc_paths(project_root);

    let ref_commit = fold_from.and_then(|day| {
        let resolved = git::resolve_ref_commit(project_root, day);
        if resolved.is_none() {
            warn!(
                fold_from = day,
                "could not resolve fold_from to a git commit; \
                 falling back to filesystem check"
            );
        }
        resolved
    });

    let mut commit_time_cache: HashMap<String, Option<OffsetDateTime>> = HashMap::new();

    DriftReport {
        orphaned_concepts: find_orphaned_concepts(
            &doc_paths.concepts,
            project_root,
            ref_commit.as_deref(),
        ),
        contested_claims: find_claims_by_status(
            &doc_paths.epistemic,
            project_root,
            "contested",
            config.thresholds.contested_review_days,
            &mut commit_time_cache,
        ),
        stale_unverified: find_claims_by_status(
            &doc_paths.epistemic,
            project_root,
            "unverified",
            config.thresholds.stale_unverified_days,
            &mut commit_time_cache,
        ),
        workflow_repetitions: find_current_workflows(&doc_paths.workflows),
        ref_commit,
    }
}

/// Current SHA-256 of the workflow registry file (cooldown key), or `None`
/// when the registry does not exist.
pub fn workflow_registry_hash(doc_paths: &DocPaths) -> Option<String> {
    use sha2::{Digest, Sha256};
    let bytes = std::fs::read(&doc_paths.workflows).ok()?;
    let digest = Sha256::digest(&bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    Some(out)
}

/// Extract file paths from a `Code:` field in a concept section.
fn extract_code_paths(section_text: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in section_text.lines() {
        let stripped = line.trim();
        let value = if let Some(rest) = stripped.strip_prefix("- **Code:**") {
            rest
        } else if let Some(rest) = stripped.strip_prefix("**Code:**") {
            rest
        } else {
            continue;
        };
        for part in value.split(',') {
            let path = part.trim().trim_matches('`').trim();
            if !path.is_empty() {
                paths.push(path.to_string());
            }
        }
    }
    paths
}

/// ACTIVE, non-stub concepts whose every referenced code path is missing.
fn find_orphaned_concepts(
    concepts_path: &Path,
    project_root: &Path,
    ref_commit: Option<&str>,
) -> Vec<OrphanedConcept> {
    let Ok(content) = std::fs::read_to_string(concepts_path) else {
        return Vec::new();
    };

    let mut orphans = Vec::new();
    for section in parse_sections(&content) {
        // ACTIVE carries no recognized status annotation; check the heading.
        if !section.heading.to_uppercase().contains("(ACTIVE") {
            continue;
        }
        if is_stub(&section.heading) {
            continue;
        }
        let code_paths = extract_code_paths(&section.text);
        if code_paths.is_empty() {
            continue;
        }

        let all_missing = match ref_commit {
            Some(commit) => code_paths
                .iter()
                .all(|p| !git::file_exists_at_commit(project_root, commit, p)),
            None => code_paths.iter().all(|p| !project_root.join(p).exists()),
        };

        if all_missing {
            orphans.push(OrphanedConcept {
                name: section.heading.trim_start_matches('#').trim().to_string(),
                id: extract_id(&section.heading),
                paths: code_paths,
            });
        }
    }
    orphans
}

/// Lines of the inline `History:` block of an epistemic section.
fn inline_history_lines(section_text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut in_history = false;

    for line in section_text.lines() {
        let stripped = line.trim();
        let normalized = stripped.strip_prefix("- ").unwrap_or(stripped).trim();
        let field = parse_field_header(normalized);

        if let Some((name, remainder)) = &field {
            if name == "history" {
                in_history = true;
                if !remainder.is_empty() {
                    lines.push(remainder.clone());
                }
                continue;
            }
            if in_history && EPISTEMIC_FIELD_NAMES.contains(&name.as_str()) {
                break;
            }
        }

        if !in_history {
            continue;
        }
        if stripped.starts_with("## ") {
            break;
        }
        if !stripped.is_empty() {
            lines.push(stripped.to_string());
        }
    }

    lines
}

/// Latest parseable activity date in a history block.
///
/// ISO dates are read directly. `Evidence@<sha>` bullets resolve the sha to
/// its commit time via git, cached within one scan; unresolvable shas and
/// unparseable lines contribute nothing.
fn latest_history_date(
    history: &[String],
    project_root: &Path,
    commit_time_cache: &mut HashMap<String, Option<OffsetDateTime>>,
) -> Option<OffsetDateTime> {
    let text = history.join("\n");
    let mut latest: Option<OffsetDateTime> = None;

    for caps in ISO_DATE_RE.captures_iter(&text) {
        if let Ok(day) = dates::parse_day(&caps[1]) {
            let dt = day.midnight().assume_utc();
            if latest.is_none_or(|l| dt > l) {
                latest = Some(dt);
            }
        }
    }

    for caps in EVIDENCE_COMMIT_RE.captures_iter(&text) {
        let sha = caps[1].to_string();
        let resolved = commit_time_cache
            .entry(sha.clone())
            .or_insert_with(|| {
                git::commit_unix_time(project_root, &sha).and_then(dates::from_unix_seconds)
            });
        if let Some(dt) = resolved {
            if latest.is_none_or(|l| *dt > l) {
                latest = Some(*dt);
            }
        }
    }

    latest
}

/// Epistemic entries with the given status whose latest history activity is
/// older than `days_threshold`. Entries without any recognizable timestamp
/// are ignored for recency.
fn find_claims_by_status(
    epistemic_path: &Path,
    project_root: &Path,
    status: &str,
    days_threshold: i64,
    commit_time_cache: &mut HashMap<String, Option<OffsetDateTime>>,
) -> Vec<AgedClaim> {
    let Ok(content) = std::fs::read_to_string(epistemic_path) else {
        return Vec::new();
    };

    let now = dates::now_utc();
    let mut results = Vec::new();

    for section in parse_sections(&content) {
        if section.status.as_deref() != Some(status) {
            continue;
        }
        if is_stub(&section.heading) {
            continue;
        }
        let history = inline_history_lines(&section.text);
        let Some(latest) = latest_history_date(&history, project_root, commit_time_cache) else {
            continue;
        };
        let age_days = (now - latest).whole_days();
        if age_days > days_threshold {
            results.push(AgedClaim {
                name: section.heading.trim_start_matches('#').trim().to_string(),
                id: extract_id(&section.heading),
                days_old: age_days,
                last_date: dates::format_day(latest),
            });
        }
    }

    results
}

/// All CURRENT, non-stub workflows. The caller compares the count to the
/// repetition threshold.
fn find_current_workflows(workflows_path: &Path) -> Vec<CurrentWorkflow> {
    let Ok(content) = std::fs::read_to_string(workflows_path) else {
        return Vec::new();
    };

    parse_sections(&content)
        .into_iter()
        .filter(|section| section.status.as_deref() == Some("current"))
        .filter(|section| !is_stub(&section.heading))
        .map(|section| CurrentWorkflow {
            name: section.heading.trim_start_matches('#').trim().to_string(),
            id: extract_id(&section.heading),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir(test_name: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = base.join(format!("engram_drift_{test_name}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn code_paths_are_extracted_from_code_field() {
        let text = "## C001: X (ACTIVE)\n- **Code:** `src/a.rs`, src/b.rs\n";
        assert_eq!(extract_code_paths(text), vec!["src/a.rs", "src/b.rs"]);
    }

    #[test]
    fn orphan_detection_uses_filesystem_without_ref_commit() {
        let dir = temp_dir("orphans_fs");
        std::fs::create_dir_all(dir.join("src")).expect("mkdir");
        std::fs::write(dir.join("src/alive.rs"), "x").expect("write");
        let concepts = dir.join("concepts.md");
        std::fs::write(
            &concepts,
            "## C001: Alive (ACTIVE)\n\n- **Code:** src/alive.rs\n\n\
             ## C002: Gone (ACTIVE)\n\n- **Code:** src/gone.rs\n\n\
             ## C003: Stubbed (DEAD) → concept_graveyard.md#C003\n",
        )
        .expect("write concepts");

        let orphans = find_orphaned_concepts(&concepts, &dir, None);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id.as_deref(), Some("C002"));
    }

    #[test]
    fn history_block_extraction_stops_at_next_field() {
        let text = "## E001: Claim (believed)\n\
                    - **History:**\n\
                    - 2026-01-05 confirmed on CI\n\
                    - **Agent guidance:** keep watching\n\
                    - trailing unrelated line\n";
        let history = inline_history_lines(text);
        assert_eq!(history, vec!["2026-01-05 confirmed on CI"]);
    }

    #[test]
    fn aged_claims_ignore_entries_without_timestamps() {
        let dir = temp_dir("aged_claims");
        let epistemic = dir.join("epistemic.md");
        std::fs::write(
            &epistemic,
            "## E001: Old contested claim (contested)\n\n\
             - **History:**\n  - 2020-01-01 disputed in review\n\n\
             ## E002: Undated contested claim (contested)\n\n\
             - **History:**\n  - disputed at some point\n",
        )
        .expect("write epistemic");

        let mut cache = HashMap::new();
        let claims = find_claims_by_status(&epistemic, &dir, "contested", 14, &mut cache);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].id.as_deref(), Some("E001"));
        assert_eq!(claims[0].last_date, "2020-01-01");
        assert!(claims[0].days_old > 14);
    }

    #[test]
    fn unresolvable_evidence_sha_does_not_raise() {
        let dir = temp_dir("bad_sha");
        let history = vec!["Evidence@deadbeef1 src/a.rs:12: looks fine".to_string()];
        let mut cache = HashMap::new();
        assert!(latest_history_date(&history, &dir, &mut cache).is_none());
        // Cached as unresolvable; a second call does not re-query git.
        assert!(latest_history_date(&history, &dir, &mut cache).is_none());
    }

    #[test]
    fn current_workflows_are_counted_for_repetition() {
        let dir = temp_dir("workflows");
        let workflows = dir.join("workflows.md");
        std::fs::write(
            &workflows,
            "## W001: Release (CURRENT)\n\n- **Context:** x\n\n\
             ## W002: Old release (SUPERSEDED) → W001\n\n\
             ## W003: Triage (CURRENT)\n\n- **Context:** y\n",
        )
        .expect("write workflows");

        let current = find_current_workflows(&workflows);
        let ids: Vec<&str> = current.iter().filter_map(|w| w.id.as_deref()).collect();
        assert_eq!(ids, vec!["W001", "W003"]);
    }

    #[test]
    fn triggered_follows_priority_order() {
        let mut config = Config::default();
        config.thresholds.contested_review_threshold = 0;
        config.thresholds.workflow_repetition = 0;

        let report = DriftReport {
            contested_claims: vec![AgedClaim {
                name: "x".to_string(),
                id: None,
                days_old: 20,
                last_date: "2026-01-01".to_string(),
            }],
            workflow_repetitions: vec![CurrentWorkflow {
                name: "w".to_string(),
                id: None,
            }],
            ..DriftReport::default()
        };

        // Contested review outranks workflow synthesis.
        assert_eq!(report.triggered(&config), Some(ChunkType::ContestedReview));
    }

    #[test]
    fn registry_hash_changes_with_content() {
        let dir = temp_dir("registry_hash");
        let doc_paths = Config::default().doc_paths(&dir);
        assert!(workflow_registry_hash(&doc_paths).is_none());

        std::fs::create_dir_all(doc_paths.workflows.parent().expect("parent")).expect("mkdir");
        std::fs::write(&doc_paths.workflows, "v1").expect("write");
        let first = workflow_registry_hash(&doc_paths).expect("hash v1");
        std::fs::write(&doc_paths.workflows, "v2").expect("write");
        let second = workflow_registry_hash(&doc_paths).expect("hash v2");
        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
    }
}
