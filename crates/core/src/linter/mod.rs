#![forbid(unsafe_code)]

//! Schema linter and invariant checks for living docs.
//!
//! `lint` validates schema + cross-references on a document set;
//! `lint_post_dispatch` additionally runs the before/after guard checks that
//! validate a fold agent's output against expectations set before dispatch.

mod guards;
mod refs;
mod schema;

pub use guards::{
    check_diff_size, check_id_compliance, check_missing_sections, is_size_guard_violation,
};
pub use refs::{validate_cross_references, validate_no_duplicate_ids};
pub use schema::{
    validate_concept_registry, validate_epistemic_state, validate_timeline,
    validate_workflow_registry,
};

use std::collections::BTreeMap;

/// A single schema violation, tagged with the doc it was found in.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Violation {
    pub doc_type: String,
    pub entry_id: Option<String>,
    pub message: String,
}

impl Violation {
    pub fn new(doc_type: &str, entry_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            doc_type: doc_type.to_string(),
            entry_id,
            message: message.into(),
        }
    }

    /// `doc_type/entry_id` location tag used in CLI output and correction
    /// prompts.
    pub fn location(&self) -> String {
        match &self.entry_id {
            Some(id) => format!("{}/{}", self.doc_type, id),
            None => self.doc_type.clone(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.location(), self.message)
    }
}

#[derive(Clone, Debug, Default)]
pub struct LintResult {
    pub violations: Vec<Violation>,
}

impl LintResult {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Validate living docs (and optionally graveyards) against schema rules and
/// cross-reference invariants.
///
/// `living_docs` maps doc type (`timeline`, `concepts`, `epistemic`,
/// `workflows`) to content; `graveyard_docs` maps `concept_graveyard` /
/// `epistemic_graveyard` to content.
pub fn lint(
    living_docs: &BTreeMap<String, String>,
    graveyard_docs: &BTreeMap<String, String>,
) -> LintResult {
    let mut violations = Vec::new();

    if let Some(content) = living_docs.get("concepts") {
        violations.extend(validate_concept_registry(content));
    }
    if let Some(content) = living_docs.get("epistemic") {
        violations.extend(validate_epistemic_state(content));
    }
    if let Some(content) = living_docs.get("workflows") {
        violations.extend(validate_workflow_registry(content));
    }
    if let Some(content) = living_docs.get("timeline") {
        violations.extend(validate_timeline(content));
    }

    let mut all: BTreeMap<String, String> = living_docs.clone();
    for (key, content) in graveyard_docs {
        all.insert(key.clone(), content.clone());
    }

    violations.extend(validate_no_duplicate_ids(&all));
    violations.extend(validate_cross_references(&all));

    LintResult { violations }
}

/// Full post-dispatch validation: schema + refs on the after state, plus
/// guards comparing before/after.
pub fn lint_post_dispatch(
    before_contents: &BTreeMap<String, String>,
    after_contents: &BTreeMap<String, String>,
    graveyard_docs: &BTreeMap<String, String>,
    pre_assigned_ids: &[String],
    expected_growth: usize,
) -> LintResult {
    let mut result = lint(after_contents, graveyard_docs);

    if expected_growth > 0 {
        let before_total: usize = before_contents.values().map(String::len).sum();
        let after_total: usize = after_contents.values().map(String::len).sum();
        result
            .violations
            .extend(check_diff_size(before_total, after_total, expected_growth));
    }

    result
        .violations
        .extend(check_missing_sections(before_contents, after_contents));

    if !pre_assigned_ids.is_empty() {
        result.violations.extend(check_id_compliance(
            after_contents,
            pre_assigned_ids,
            before_contents,
        ));
    }

    result
}
