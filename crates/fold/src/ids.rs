#![forbid(unsafe_code)]

//! Identifier pre-assignment.
//!
//! A chunk's identifiers are reserved up front, never lazily: the fold agent
//! uses only what the chunk input lists. Before reserving, the counter floor
//! is raised above every id already present in the living docs and
//! graveyards, so externally edited docs can never collide with the
//! counters. Reserved-but-unused ids are simply skipped by the monotonic
//! counters; no reclamation is attempted.

use std::collections::BTreeMap;
use std::path::Path;

use crate::FoldError;
use crate::queue::QueueEntry;
use engram_core::parse::{extract_id, id_number, parse_sections};
use engram_core::{DocPaths, IdCategory};
use engram_storage::StateStore;

/// Pre-assigned identifier strings per category prefix (`"C"`, `"E"`, `"W"`).
pub type PreAssigned = BTreeMap<String, Vec<String>>;

/// Flatten pre-assigned ids into the linter's expected list form.
pub fn flatten(pre_assigned: &PreAssigned) -> Vec<String> {
    pre_assigned.values().flatten().cloned().collect()
}

/// Estimate how many new entities a chunk's items will produce per category.
///
/// Adapter kinds map to the entries they typically create: initial doc
/// passes introduce concepts, issues introduce claims, sessions introduce
/// workflows. Each estimate is capped; over-reservation is harmless.
pub fn estimate_new_entities(items: &[QueueEntry], cap: usize) -> BTreeMap<IdCategory, usize> {
    let mut counts: BTreeMap<IdCategory, usize> = BTreeMap::new();
    for item in items {
        let category = match item.kind.as_str() {
            "doc" if item.pass == "initial" => Some(IdCategory::Concept),
            "issue" => Some(IdCategory::Epistemic),
            "prompts" => Some(IdCategory::Workflow),
            _ => None,
        };
        if let Some(category) = category {
            *counts.entry(category).or_default() += 1;
        }
    }
    for count in counts.values_mut() {
        *count = (*count).min(cap);
    }
    counts.retain(|_, count| *count > 0);
    counts
}

/// Highest numeric id of `category` found in the given documents.
fn max_existing_id(paths: &[&Path], category: IdCategory) -> i64 {
    let prefix = category.prefix();
    let mut max_id = 0;
    for path in paths {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for section in parse_sections(&content) {
            let Some(entry_id) = extract_id(&section.heading) else {
                continue;
            };
            if entry_id.starts_with(prefix) {
                if let Some(n) = id_number(&entry_id) {
                    max_id = max_id.max(n);
                }
            }
        }
    }
    max_id
}

/// The documents that can legitimately hold ids of a category: the home
/// living doc plus its graveyard (graveyard ids are retired, never reusable).
fn home_docs(doc_paths: &DocPaths, category: IdCategory) -> Vec<&Path> {
    match category {
        IdCategory::Concept => vec![
            doc_paths.concepts.as_path(),
            doc_paths.concept_graveyard.as_path(),
        ],
        IdCategory::Epistemic => vec![
            doc_paths.epistemic.as_path(),
            doc_paths.epistemic_graveyard.as_path(),
        ],
        IdCategory::Workflow => vec![doc_paths.workflows.as_path()],
    }
}

/// Raise each counter floor above the docs, then reserve the estimated
/// ranges. Returns formatted ids per category prefix, ready to embed in the
/// chunk input.
pub fn pre_assign(
    store: &mut StateStore,
    doc_paths: &DocPaths,
    estimates: &BTreeMap<IdCategory, usize>,
) -> Result<PreAssigned, FoldError> {
    let mut assigned = PreAssigned::new();

    for category in IdCategory::ALL {
        let max_existing = max_existing_id(&home_docs(doc_paths, category), category);

        let Some(count) = estimates.get(&category).copied().filter(|c| *c > 0) else {
            store.bump_counter_floor(category, max_existing + 1)?;
            continue;
        };
        let range = store.reserve_ids_with_floor(category, max_existing + 1, count)?;
        assigned.insert(category.as_str().to_string(), range.formatted());
    }

    Ok(assigned)
}
