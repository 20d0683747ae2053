#![forbid(unsafe_code)]

//! One-time migration of legacy living docs to the stable-ID format.
//!
//! Five phases, all idempotent: backfill `C###/E###/W###` ids onto legacy
//! headings, extract workflow-like entries into the workflow registry,
//! compact DEAD/EVOLVED/refuted entries into the graveyards (leaving pointer
//! stubs), rewrite name-based cross-references to stable ids, and initialise
//! the id counters above everything assigned. Optionally sets the fold-from
//! marker for a later forward fold.

use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::info;

use crate::bootstrap::ensure_living_docs;
use crate::error::ServerError;
use engram_core::linter::{self, LintResult};
use engram_core::parse::{Section, extract_id, id_number, is_stub, parse_sections};
use engram_core::{Config, IdCategory};
use engram_fold::engram_dir;
use engram_storage::StateStore;

/// Legacy headings: `## Name (STATUS)` with no stable-ID prefix.
static LEGACY_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+(.+?)\s*\(([^)]+)\)\s*$").expect("LEGACY_HEADING_RE should compile")
});
static ID_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+[CEW]\d{3,}:\s+(.+?)\s*\(([^)]+)\)").expect("ID_HEADING_RE should compile")
});
/// Entries carrying these fields are workflow-like.
static WORKFLOW_FIELDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*-?\s*\*?\*?(?:Context|Current method|Trigger(?:\s+for\s+change)?)\*?\*?:")
        .expect("WORKFLOW_FIELDS_RE should compile")
});

#[derive(Clone, Debug, Default)]
pub struct MigrateReport {
    pub backfilled: usize,
    pub workflows_extracted: usize,
    pub compacted: usize,
    pub counters: BTreeMap<String, i64>,
    pub lint: LintResult,
}

/// Normalize a legacy status string to its canonical form for the target
/// category; unknown statuses pass through unchanged.
fn normalize_status(raw: &str, category: IdCategory) -> String {
    let key = raw
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    let canonical = match category {
        IdCategory::Concept => match key.as_str() {
            "active" => Some("ACTIVE"),
            "dead" => Some("DEAD"),
            "evolved" => Some("EVOLVED"),
            _ => None,
        },
        IdCategory::Epistemic => match key.as_str() {
            "believed" => Some("believed"),
            "refuted" => Some("refuted"),
            "contested" => Some("contested"),
            "unverified" => Some("unverified"),
            _ => None,
        },
        IdCategory::Workflow => match key.as_str() {
            "current" => Some("CURRENT"),
            "superseded" => Some("SUPERSEDED"),
            "merged" => Some("MERGED"),
            _ => None,
        },
    };
    canonical
        .map(str::to_string)
        .unwrap_or_else(|| raw.trim().to_string())
}

/// Phase 1: assign stable ids to legacy entries that lack them.
/// Returns `(new_content, name→id map, backfilled count)`.
fn backfill_ids(
    content: &str,
    category: IdCategory,
    counters: &mut BTreeMap<IdCategory, i64>,
) -> (String, BTreeMap<String, String>, usize) {
    let sections = parse_sections(content);
    if sections.is_empty() {
        return (content.to_string(), BTreeMap::new(), 0);
    }

    let lines: Vec<&str> = content.split('\n').collect();
    let mut out: Vec<String> = lines[..sections[0].start]
        .iter()
        .map(|l| l.to_string())
        .collect();
    let mut name_to_id = BTreeMap::new();
    let mut backfilled = 0usize;

    for section in &sections {
        let heading = &section.heading;

        if let Some(existing) = extract_id(heading) {
            if let Some(caps) = ID_HEADING_RE.captures(heading) {
                name_to_id.insert(caps[1].trim().to_string(), existing.clone());
            }
            // Track the ceiling so fresh assignments stay above kept ids.
            if existing.starts_with(category.prefix()) {
                if let Some(n) = id_number(&existing) {
                    let next = counters.entry(category).or_insert(1);
                    *next = (*next).max(n + 1);
                }
            }
            out.extend(section.text.split('\n').map(str::to_string));
            continue;
        }

        let Some(caps) = LEGACY_HEADING_RE.captures(heading) else {
            out.extend(section.text.split('\n').map(str::to_string));
            continue;
        };

        let name = caps[1].trim().to_string();
        let status = normalize_status(&caps[2], category);
        let next = counters.entry(category).or_insert(1);
        let entry_id = category.format_id(*next);
        *next += 1;
        backfilled += 1;
        name_to_id.insert(name.clone(), entry_id.clone());

        let mut section_lines: Vec<String> =
            section.text.split('\n').map(str::to_string).collect();
        section_lines[0] = format!("## {entry_id}: {name} ({status})");
        out.extend(section_lines);
    }

    (out.join("\n"), name_to_id, backfilled)
}

/// Phase 2: move workflow-like entries out of the concept/epistemic docs into
/// the workflow registry, re-assigning W ids where needed.
fn extract_workflows(
    concept_content: &str,
    epistemic_content: &str,
    workflow_content: &str,
    counters: &mut BTreeMap<IdCategory, i64>,
) -> (String, String, String, usize) {
    let mut extracted: Vec<String> = Vec::new();

    let mut process_doc = |content: &str| -> String {
        let sections = parse_sections(content);
        if sections.is_empty() {
            return content.to_string();
        }
        let lines: Vec<&str> = content.split('\n').collect();
        let mut out: Vec<String> = lines[..sections[0].start]
            .iter()
            .map(|l| l.to_string())
            .collect();

        for section in &sections {
            if !WORKFLOW_FIELDS_RE.is_match(&section.text) || is_stub(&section.heading) {
                out.extend(section.text.split('\n').map(str::to_string));
                continue;
            }

            let existing = extract_id(&section.heading);
            if existing.as_deref().is_some_and(|id| id.starts_with('W')) {
                extracted.push(section.text.clone());
                continue;
            }

            let Some(caps) = ID_HEADING_RE
                .captures(&section.heading)
                .or_else(|| LEGACY_HEADING_RE.captures(&section.heading))
            else {
                out.extend(section.text.split('\n').map(str::to_string));
                continue;
            };
            let name = caps[1].trim().to_string();
            let status = normalize_status(&caps[2], IdCategory::Workflow);
            let next = counters.entry(IdCategory::Workflow).or_insert(1);
            let entry_id = IdCategory::Workflow.format_id(*next);
            *next += 1;

            let mut section_lines: Vec<String> =
                section.text.split('\n').map(str::to_string).collect();
            section_lines[0] = format!("## {entry_id}: {name} ({status})");
            extracted.push(section_lines.join("\n"));
        }

        out.join("\n")
    };

    let new_concepts = process_doc(concept_content);
    let new_epistemic = process_doc(epistemic_content);

    let count = extracted.len();
    let new_workflows = if extracted.is_empty() {
        workflow_content.to_string()
    } else if workflow_content.trim().is_empty() {
        extracted.join("\n\n")
    } else {
        format!("{}\n\n{}", workflow_content.trim_end(), extracted.join("\n\n"))
    };

    (new_concepts, new_epistemic, new_workflows, count)
}

fn graveyard_statuses(category: IdCategory) -> &'static [&'static str] {
    match category {
        IdCategory::Concept => &["dead", "evolved"],
        IdCategory::Epistemic => &["refuted"],
        IdCategory::Workflow => &[],
    }
}

fn stub_for(section: &Section, graveyard_filename: &str) -> Option<String> {
    let entry_id = extract_id(&section.heading)?;
    let caps = ID_HEADING_RE.captures(&section.heading)?;
    let name = caps[1].trim().to_string();
    let status = caps[2].trim().to_string();
    Some(format!(
        "## {entry_id}: {name} ({status}) → {graveyard_filename}#{entry_id}"
    ))
}

/// Phase 3: move retired full entries into the graveyard, leaving one-line
/// pointer stubs. Already-stubbed entries are left alone, which is what
/// makes a second run a no-op.
fn compact_into_graveyard(
    content: &str,
    category: IdCategory,
    graveyard_path: &Path,
) -> Result<(String, usize), ServerError> {
    let sections = parse_sections(content);
    if sections.is_empty() {
        return Ok((content.to_string(), 0));
    }

    let graveyard_filename = graveyard_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let lines: Vec<&str> = content.split('\n').collect();
    let mut out: Vec<String> = lines[..sections[0].start]
        .iter()
        .map(|l| l.to_string())
        .collect();
    let mut moved = 0usize;

    for section in &sections {
        let is_retired = section
            .status
            .as_deref()
            .is_some_and(|s| graveyard_statuses(category).contains(&s));
        if !is_retired || is_stub(&section.heading) {
            out.extend(section.text.split('\n').map(str::to_string));
            continue;
        }
        let Some(stub) = stub_for(section, &graveyard_filename) else {
            out.extend(section.text.split('\n').map(str::to_string));
            continue;
        };

        let mut graveyard = std::fs::read_to_string(graveyard_path).unwrap_or_default();
        if !graveyard.is_empty() && !graveyard.ends_with("\n\n") {
            if !graveyard.ends_with('\n') {
                graveyard.push('\n');
            }
            graveyard.push('\n');
        }
        graveyard.push_str(section.text.trim_end());
        graveyard.push('\n');
        std::fs::write(graveyard_path, graveyard)?;

        out.push(stub);
        out.push(String::new());
        moved += 1;
    }

    Ok((out.join("\n"), moved))
}

/// Phase 4: rewrite name-based references to stable ids, longest names first
/// so partial matches cannot clobber longer ones.
fn rewrite_cross_references(content: &str, name_to_id: &BTreeMap<String, String>) -> String {
    let mut names: Vec<&String> = name_to_id.keys().collect();
    names.sort_by_key(|name| std::cmp::Reverse(name.len()));

    let mut out = content.to_string();
    for name in names {
        let entry_id = &name_to_id[name];
        if Regex::new(r"^[CEW]\d{3,}$")
            .map(|re| re.is_match(name))
            .unwrap_or(false)
        {
            continue;
        }
        let pattern = format!(r"\bsee {}\b", regex::escape(name));
        if let Ok(re) = Regex::new(&pattern) {
            out = re.replace_all(&out, format!("see {entry_id}")).to_string();
        }
    }
    out
}

/// Run the full migration. Safe to re-run: ids are only assigned to headings
/// that lack them and retired entries are only moved once.
pub fn migrate(
    config: &Config,
    project_root: &Path,
    fold_from: Option<&str>,
) -> Result<MigrateReport, ServerError> {
    if let Some(day) = fold_from {
        engram_core::dates::parse_day(day).map_err(|_| {
            ServerError::Fold(engram_fold::FoldError::InvalidStartDate(day.to_string()))
        })?;
    }

    ensure_living_docs(config, project_root)?;
    let doc_paths = config.doc_paths(project_root);
    let mut store = StateStore::open(engram_dir(project_root))?;
    let mut report = MigrateReport::default();
    let mut counters: BTreeMap<IdCategory, i64> = BTreeMap::new();
    let mut name_to_id: BTreeMap<String, String> = BTreeMap::new();

    // Phase 1: backfill ids per doc.
    let mut contents: BTreeMap<IdCategory, String> = BTreeMap::new();
    for (category, path) in [
        (IdCategory::Concept, &doc_paths.concepts),
        (IdCategory::Epistemic, &doc_paths.epistemic),
        (IdCategory::Workflow, &doc_paths.workflows),
    ] {
        let content = std::fs::read_to_string(path).unwrap_or_default();
        let (new_content, names, backfilled) = backfill_ids(&content, category, &mut counters);
        report.backfilled += backfilled;
        name_to_id.extend(names);
        contents.insert(category, new_content);
    }

    // Phase 2: extract workflow-like entries into the registry.
    let (concepts, epistemic, workflows, extracted) = extract_workflows(
        &contents[&IdCategory::Concept],
        &contents[&IdCategory::Epistemic],
        &contents[&IdCategory::Workflow],
        &mut counters,
    );
    report.workflows_extracted = extracted;

    // Phase 3: graveyard compaction.
    let (concepts, moved_concepts) =
        compact_into_graveyard(&concepts, IdCategory::Concept, &doc_paths.concept_graveyard)?;
    let (epistemic, moved_claims) = compact_into_graveyard(
        &epistemic,
        IdCategory::Epistemic,
        &doc_paths.epistemic_graveyard,
    )?;
    report.compacted = moved_concepts + moved_claims;

    // Phase 4: cross-reference rewrite over all living docs.
    let timeline = std::fs::read_to_string(&doc_paths.timeline).unwrap_or_default();
    std::fs::write(&doc_paths.concepts, rewrite_cross_references(&concepts, &name_to_id))?;
    std::fs::write(&doc_paths.epistemic, rewrite_cross_references(&epistemic, &name_to_id))?;
    std::fs::write(&doc_paths.workflows, rewrite_cross_references(&workflows, &name_to_id))?;
    std::fs::write(&doc_paths.timeline, rewrite_cross_references(&timeline, &name_to_id))?;

    // Phase 5: counters above everything assigned.
    for category in IdCategory::ALL {
        let next = counters.get(&category).copied().unwrap_or(1);
        store.bump_counter_floor(category, next)?;
        report
            .counters
            .insert(category.as_str().to_string(), store.peek_counter(category)?);
    }

    // Phase 6: optional fold continuation marker.
    if let Some(day) = fold_from {
        store.set_fold_from(day)?;
        info!(day, "fold continuation marker set");
    }

    // Phase 7: validation pass.
    let living = doc_paths.read_living();
    let graveyards = doc_paths.read_graveyards();
    report.lint = linter::lint(&living, &graveyards);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_assigns_ids_in_document_order() {
        let content = "# Concepts\n\n\
                       ## Order book (active)\n\nbody a\n\n\
                       ## C007: Keeps its id (ACTIVE)\n\nbody b\n\n\
                       ## Matching engine (dead)\n\nbody c\n";
        let mut counters = BTreeMap::new();
        let (out, names, backfilled) = backfill_ids(content, IdCategory::Concept, &mut counters);

        assert_eq!(backfilled, 2);
        assert!(out.contains("## C001: Order book (ACTIVE)"));
        assert!(out.contains("## C007: Keeps its id (ACTIVE)"));
        // Fresh ids after the kept C007 stay above it.
        assert!(out.contains("## C008: Matching engine (DEAD)"));
        assert_eq!(names.get("Order book").map(String::as_str), Some("C001"));
    }

    #[test]
    fn backfill_is_idempotent() {
        let content = "## Order book (active)\n\nbody\n";
        let mut counters = BTreeMap::new();
        let (first, _, _) = backfill_ids(content, IdCategory::Concept, &mut counters);
        let mut counters2 = BTreeMap::new();
        let (second, _, backfilled) = backfill_ids(&first, IdCategory::Concept, &mut counters2);
        assert_eq!(backfilled, 0);
        assert_eq!(first, second);
    }

    #[test]
    fn workflow_entries_move_to_registry() {
        let concepts = "## C001: Deploy ritual (ACTIVE)\n\n- **Context:** release day\n- **Current method:** tag\n\n\
                        ## C002: Real concept (ACTIVE)\n\n- **Code:** src/a.rs\n";
        let mut counters = BTreeMap::new();
        let (new_concepts, _, new_workflows, extracted) =
            extract_workflows(concepts, "", "", &mut counters);

        assert_eq!(extracted, 1);
        assert!(!new_concepts.contains("Deploy ritual"));
        assert!(new_concepts.contains("Real concept"));
        assert!(new_workflows.contains("## W001: Deploy ritual (ACTIVE)"));
    }

    #[test]
    fn compaction_leaves_stubs_and_appends_full_entries() {
        let base = std::env::temp_dir();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let graveyard = base.join(format!("engram_migrate_gy_{}_{nonce}.md", std::process::id()));

        let content = "## C001: Alive (ACTIVE)\n\n- **Code:** src/a.rs\n\n\
                       ## C002: Gone (DEAD)\n\nFull dead body.\n";
        let (out, moved) =
            compact_into_graveyard(content, IdCategory::Concept, &graveyard).expect("compact");

        assert_eq!(moved, 1);
        assert!(out.contains("## C002: Gone (DEAD) → "));
        assert!(out.contains("#C002"));
        assert!(!out.contains("Full dead body."));
        let graveyard_text = std::fs::read_to_string(&graveyard).expect("graveyard");
        assert!(graveyard_text.contains("Full dead body."));

        // Second run: the stub stays a stub, nothing moves again.
        let (again, moved_again) =
            compact_into_graveyard(&out, IdCategory::Concept, &graveyard).expect("recompact");
        assert_eq!(moved_again, 0);
        assert_eq!(again, out);
    }

    #[test]
    fn see_references_are_rewritten() {
        let names = BTreeMap::from([("Order book".to_string(), "C001".to_string())]);
        let content = "Background: see Order book for details.";
        assert_eq!(
            rewrite_cross_references(content, &names),
            "Background: see C001 for details."
        );
    }
}
