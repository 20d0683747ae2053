#![forbid(unsafe_code)]

//! Guard checks: diff size, missing sections, ID compliance.
//!
//! Post-dispatch checks that validate the fold agent's output against
//! expectations set before dispatch.

use crate::parse::{extract_id, parse_sections};
use std::collections::{BTreeMap, BTreeSet};

use super::Violation;

/// Flag when actual growth exceeds 2x the expected growth for this chunk.
pub fn check_diff_size(
    before_chars: usize,
    after_chars: usize,
    expected_growth: usize,
) -> Vec<Violation> {
    if expected_growth == 0 {
        return Vec::new();
    }

    let actual_growth = after_chars.saturating_sub(before_chars);
    if actual_growth > 2 * expected_growth {
        return vec![Violation::new(
            "guard",
            None,
            format!(
                "Diff size guard: actual growth ({actual_growth} chars) exceeds 2x expected \
                 ({expected_growth} chars). Before: {before_chars}, after: {after_chars}"
            ),
        )];
    }
    Vec::new()
}

/// Whether a violation came from the diff-size guard. The dispatcher allows
/// such failures a single retry instead of the full budget.
pub fn is_size_guard_violation(violation: &Violation) -> bool {
    violation.doc_type == "guard" && violation.message.starts_with("Diff size guard")
}

fn collect_ids(contents: &BTreeMap<String, String>, doc_types: &[&str]) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    for doc_type in doc_types {
        let Some(content) = contents.get(*doc_type) else {
            continue;
        };
        for section in parse_sections(content) {
            if let Some(entry_id) = extract_id(&section.heading) {
                ids.insert(entry_id);
            }
        }
    }
    ids
}

const LIVING_DOC_TYPES: [&str; 4] = ["concepts", "epistemic", "workflows", "timeline"];

/// Detect sections that existed before dispatch but disappeared after.
///
/// Entries move to the graveyard as stubs; they never vanish. This catches
/// silent truncation or accidental deletion.
pub fn check_missing_sections(
    before_contents: &BTreeMap<String, String>,
    after_contents: &BTreeMap<String, String>,
) -> Vec<Violation> {
    let mut violations = Vec::new();

    for doc_type in LIVING_DOC_TYPES {
        let (Some(before), Some(after)) = (before_contents.get(doc_type), after_contents.get(doc_type))
        else {
            continue;
        };

        let before_ids = collect_ids(
            &BTreeMap::from([(doc_type.to_string(), before.clone())]),
            &[doc_type],
        );
        let after_ids = collect_ids(
            &BTreeMap::from([(doc_type.to_string(), after.clone())]),
            &[doc_type],
        );

        for entry_id in before_ids.difference(&after_ids) {
            violations.push(Violation::new(
                doc_type,
                Some(entry_id.clone()),
                format!(
                    "Section '{entry_id}' existed before dispatch but is missing after. \
                     Fold agents should not delete sections."
                ),
            ));
        }
    }

    violations
}

/// Verify pre-assigned IDs appear in output and no extras were invented.
pub fn check_id_compliance(
    after_contents: &BTreeMap<String, String>,
    pre_assigned_ids: &[String],
    before_contents: &BTreeMap<String, String>,
) -> Vec<Violation> {
    if pre_assigned_ids.is_empty() {
        return Vec::new();
    }

    let mut violations = Vec::new();

    let all_doc_types: Vec<&str> = after_contents.keys().map(String::as_str).collect();
    let after_ids = collect_ids(after_contents, &all_doc_types);
    let before_types: Vec<&str> = before_contents.keys().map(String::as_str).collect();
    let before_ids = collect_ids(before_contents, &before_types);

    let pre_assigned: BTreeSet<String> = pre_assigned_ids.iter().cloned().collect();

    for entry_id in pre_assigned.difference(&after_ids) {
        violations.push(Violation::new(
            "guard",
            Some(entry_id.clone()),
            format!(
                "Pre-assigned ID '{entry_id}' not found in output. \
                 Fold agent did not create the expected entry."
            ),
        ));
    }

    let new_ids: BTreeSet<String> = after_ids.difference(&before_ids).cloned().collect();
    for entry_id in new_ids.difference(&pre_assigned) {
        violations.push(Violation::new(
            "guard",
            Some(entry_id.clone()),
            format!(
                "Agent-invented ID '{entry_id}' not in pre-assigned set. \
                 Fold agents must use pre-assigned IDs, not invent their own."
            ),
        ));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn diff_size_guard_fires_above_double() {
        assert!(check_diff_size(1000, 1500, 1000).is_empty());
        assert!(check_diff_size(1000, 3000, 1000).is_empty()); // exactly 2x
        let violations = check_diff_size(1000, 3101, 1000);
        assert_eq!(violations.len(), 1);
        assert!(is_size_guard_violation(&violations[0]));
    }

    #[test]
    fn zero_expected_growth_disables_guard() {
        assert!(check_diff_size(0, 1_000_000, 0).is_empty());
    }

    #[test]
    fn vanished_section_is_flagged() {
        let before = docs(&[("concepts", "## C001: A (ACTIVE)\n\n## C002: B (ACTIVE)\n")]);
        let after = docs(&[("concepts", "## C001: A (ACTIVE)\n")]);
        let violations = check_missing_sections(&before, &after);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].entry_id.as_deref(), Some("C002"));
    }

    #[test]
    fn id_compliance_checks_both_directions() {
        let before = docs(&[("concepts", "## C001: A (ACTIVE)\n")]);
        // C002 was pre-assigned but never written; C009 was invented.
        let after = docs(&[("concepts", "## C001: A (ACTIVE)\n\n## C009: X (ACTIVE)\n")]);
        let pre = vec!["C002".to_string()];
        let violations = check_id_compliance(&after, &pre, &before);
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().any(|v| v.message.contains("Pre-assigned")));
        assert!(violations.iter().any(|v| v.message.contains("Agent-invented")));
    }

    #[test]
    fn compliant_output_passes() {
        let before = docs(&[("concepts", "## C001: A (ACTIVE)\n")]);
        let after = docs(&[("concepts", "## C001: A (ACTIVE)\n\n## C002: B (ACTIVE)\n")]);
        let pre = vec!["C002".to_string()];
        assert!(check_id_compliance(&after, &pre, &before).is_empty());
    }
}
