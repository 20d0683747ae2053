#![forbid(unsafe_code)]

//! Cross-reference validation.
//!
//! Every `C###`/`E###`/`W###` reference must resolve to an existing entry,
//! and no ID may be defined twice across its home doc and graveyard.

use crate::parse::{extract_id, extract_referenced_ids, parse_sections};
use std::collections::BTreeMap;

use super::Violation;

/// Check that no ID appears more than once across its home doc + graveyard.
pub fn validate_no_duplicate_ids(contents: &BTreeMap<String, String>) -> Vec<Violation> {
    let mut violations = Vec::new();

    let registry_groups: [(&str, &[&str]); 3] = [
        ("C", &["concepts", "concept_graveyard"]),
        ("E", &["epistemic", "epistemic_graveyard"]),
        ("W", &["workflows"]),
    ];

    for (prefix, doc_types) in registry_groups {
        let mut seen: BTreeMap<String, String> = BTreeMap::new();
        for doc_type in doc_types {
            let Some(content) = contents.get(*doc_type) else {
                continue;
            };
            for section in parse_sections(content) {
                let Some(entry_id) = extract_id(&section.heading) else {
                    continue;
                };
                if !entry_id.starts_with(prefix) {
                    continue;
                }
                match seen.get(&entry_id) {
                    Some(first_doc) => violations.push(Violation::new(
                        doc_type,
                        Some(entry_id.clone()),
                        format!("Duplicate ID '{entry_id}' — also in {first_doc}"),
                    )),
                    None => {
                        seen.insert(entry_id, (*doc_type).to_string());
                    }
                }
            }
        }
    }

    violations
}

/// Check that every referenced ID resolves to a defined entry in the living
/// docs or graveyards.
pub fn validate_cross_references(contents: &BTreeMap<String, String>) -> Vec<Violation> {
    let mut violations = Vec::new();

    let mut defined: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    for content in contents.values() {
        for section in parse_sections(content) {
            if let Some(entry_id) = extract_id(&section.heading) {
                defined.insert(entry_id);
            }
        }
    }

    let home_doc = |prefix: char| match prefix {
        'C' => "concepts",
        'E' => "epistemic",
        'W' => "workflows",
        _ => "unknown",
    };

    for (doc_type, content) in contents {
        for ref_id in extract_referenced_ids(content) {
            if !defined.contains(&ref_id) {
                let prefix = ref_id.chars().next().unwrap_or('?');
                violations.push(Violation::new(
                    doc_type,
                    None,
                    format!(
                        "Unresolved reference '{ref_id}' — not found in {} or its graveyard",
                        home_doc(prefix)
                    ),
                ));
            }
        }
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
    fn duplicate_across_living_and_graveyard_is_flagged() {
        let contents = docs(&[
            ("concepts", "## C001: Book (ACTIVE)\n\n- **Code:** a\n"),
            ("concept_graveyard", "## C001: Book (DEAD)\n\nold\n"),
        ]);
        let violations = validate_no_duplicate_ids(&contents);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("also in concepts"));
    }

    #[test]
    fn same_numeral_in_different_categories_is_fine() {
        let contents = docs(&[
            ("concepts", "## C001: Book (ACTIVE)\n"),
            ("epistemic", "## E001: Claim (believed)\n"),
        ]);
        assert!(validate_no_duplicate_ids(&contents).is_empty());
    }

    #[test]
    fn unresolved_reference_names_home_doc() {
        let contents = docs(&[("timeline", "Phase refs W009.\n")]);
        let violations = validate_cross_references(&contents);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("workflows"));
    }

    #[test]
    fn defined_anywhere_resolves() {
        let contents = docs(&[
            ("timeline", "Phase refs E002.\n"),
            ("epistemic_graveyard", "## E002: Claim (refuted)\n\nx\n"),
        ]);
        assert!(validate_cross_references(&contents).is_empty());
    }
}
