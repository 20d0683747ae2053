#![forbid(unsafe_code)]

//! FULL vs STUB heading validation per doc type.
//!
//! concept registry: FULL (ACTIVE) requires `Code:`; STUB (DEAD|EVOLVED) is a
//! pointer only. Epistemic state: FULL (believed|contested|unverified)
//! requires `Evidence:` or `History:`; audited believed/unverified entries
//! must carry at least one claim-specific `Evidence@<commit>` bullet, and
//! generic "reaffirmed → believed" lines are invalid; STUB (refuted) is a
//! pointer only. Workflow registry: FULL (CURRENT) requires `Context:` plus
//! `Trigger:` or `Current method:`; STUB (SUPERSEDED|MERGED) is a pointer
//! only. Timeline: phase sections must carry an `IDs:` line.

use crate::parse::{extract_id, is_phase_heading, is_stub, parse_sections};
use regex::Regex;
use std::sync::LazyLock;

use super::Violation;

static CONCEPT_FULL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+C\d{3,}:\s+.+\(ACTIVE(?:\s*—\s*.+)?\)\s*$")
        .expect("CONCEPT_FULL_RE should compile")
});
static CONCEPT_STUB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+C\d{3,}:\s+.+\((?:DEAD|EVOLVED[^)]*)\)\s*→\s*\S+")
        .expect("CONCEPT_STUB_RE should compile")
});

static EPISTEMIC_FULL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^##\s+E\d{3,}:\s+.+\((?:believed|contested|unverified)\)\s*$")
        .expect("EPISTEMIC_FULL_RE should compile")
});
static EPISTEMIC_STUB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^##\s+E\d{3,}:\s+.+\(refuted\)\s*→\s*\S+")
        .expect("EPISTEMIC_STUB_RE should compile")
});

static WORKFLOW_FULL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+W\d{3,}:\s+.+\(CURRENT(?:\s*—\s*.+)?\)\s*$")
        .expect("WORKFLOW_FULL_RE should compile")
});
static WORKFLOW_STUB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+W\d{3,}:\s+.+\((?:SUPERSEDED|MERGED)[^)]*\)\s*→\s*\S+")
        .expect("WORKFLOW_STUB_RE should compile")
});

// Required field patterns (bold markdown fields inside a section body).
static CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*-?\s*\*?\*?Code\*?\*?:").expect("CODE_RE should compile")
});
static EVIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*-?\s*\*?\*?Evidence\*?\*?:").expect("EVIDENCE_RE should compile")
});
static HISTORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*-?\s*\*?\*?History\*?\*?:").expect("HISTORY_RE should compile")
});
static EVIDENCE_AT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*-\s*Evidence@\S+").expect("EVIDENCE_AT_RE should compile")
});
static AUDIT_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Epistemic\s+audit").expect("AUDIT_MARKER_RE should compile")
});
static REAFFIRMED_BELIEVED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)reaffirmed.*believed").expect("REAFFIRMED_BELIEVED_RE should compile")
});
static EPISTEMIC_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\((believed|contested|unverified)\)\s*$")
        .expect("EPISTEMIC_STATUS_RE should compile")
});
static CONTEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*-?\s*\*?\*?Context\*?\*?:").expect("CONTEXT_RE should compile")
});
static TRIGGER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*-?\s*\*?\*?Trigger(?:\s+for\s+change)?\*?\*?:")
        .expect("TRIGGER_RE should compile")
});
static CURRENT_METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*-?\s*\*?\*?Current method\*?\*?:")
        .expect("CURRENT_METHOD_RE should compile")
});
static IDS_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*-?\s*\*?\*?IDs\*?\*?:").expect("IDS_LINE_RE should compile")
});

pub fn validate_concept_registry(content: &str) -> Vec<Violation> {
    let mut violations = Vec::new();

    for section in parse_sections(content) {
        let heading = &section.heading;
        let Some(entry_id) = extract_id(heading) else {
            continue; // preamble or non-entry section
        };

        if !entry_id.starts_with('C') {
            violations.push(Violation::new(
                "concepts",
                Some(entry_id.clone()),
                format!("Non-concept ID '{entry_id}' in concept registry"),
            ));
            continue;
        }

        if is_stub(heading) {
            if !CONCEPT_STUB_RE.is_match(heading) {
                violations.push(Violation::new(
                    "concepts",
                    Some(entry_id),
                    "Stub heading does not match expected pattern: \
                     ## C{NNN}: {name} (DEAD|EVOLVED) → {target}",
                ));
            }
            continue;
        }

        if !CONCEPT_FULL_RE.is_match(heading) {
            violations.push(Violation::new(
                "concepts",
                Some(entry_id),
                "Heading does not match FULL or STUB pattern. Expected: \
                 ## C{NNN}: {name} (ACTIVE[ — MODIFIER]) or \
                 ## C{NNN}: {name} (DEAD|EVOLVED) → target",
            ));
            continue;
        }

        if !CODE_RE.is_match(&section.text) {
            violations.push(Violation::new(
                "concepts",
                Some(entry_id),
                "ACTIVE concept missing required 'Code:' field",
            ));
        }
    }

    violations
}

pub fn validate_epistemic_state(content: &str) -> Vec<Violation> {
    let mut violations = Vec::new();

    for section in parse_sections(content) {
        let heading = &section.heading;
        let Some(entry_id) = extract_id(heading) else {
            continue;
        };

        if !entry_id.starts_with('E') {
            violations.push(Violation::new(
                "epistemic",
                Some(entry_id.clone()),
                format!("Non-epistemic ID '{entry_id}' in epistemic state"),
            ));
            continue;
        }

        if is_stub(heading) {
            if !EPISTEMIC_STUB_RE.is_match(heading) {
                violations.push(Violation::new(
                    "epistemic",
                    Some(entry_id),
                    "Stub heading does not match expected pattern: \
                     ## E{NNN}: {name} (refuted) → {target}",
                ));
            }
            continue;
        }

        if !EPISTEMIC_FULL_RE.is_match(heading) {
            violations.push(Violation::new(
                "epistemic",
                Some(entry_id),
                "Heading does not match FULL or STUB pattern. Expected: \
                 ## E{NNN}: {name} (believed|contested|unverified) or \
                 ## E{NNN}: {name} (refuted) → target",
            ));
            continue;
        }

        let body = &section.text;
        if !EVIDENCE_RE.is_match(body) && !HISTORY_RE.is_match(body) {
            violations.push(Violation::new(
                "epistemic",
                Some(entry_id),
                "Non-refuted epistemic entry missing required 'Evidence:' or 'History:' field",
            ));
            continue;
        }

        // Generic reaffirmation language is too weak for epistemic retention.
        if REAFFIRMED_BELIEVED_RE.is_match(body) {
            violations.push(Violation::new(
                "epistemic",
                Some(entry_id.clone()),
                "Generic 'reaffirmed -> believed' history is not allowed; \
                 use claim-specific Evidence@<commit> bullets",
            ));
        }

        // Audited believed/unverified entries need commit-pinned evidence.
        let status = EPISTEMIC_STATUS_RE
            .captures(heading)
            .map(|c| c[1].to_lowercase())
            .unwrap_or_default();
        if matches!(status.as_str(), "believed" | "unverified")
            && AUDIT_MARKER_RE.is_match(body)
            && !EVIDENCE_AT_RE.is_match(body)
        {
            violations.push(Violation::new(
                "epistemic",
                Some(entry_id),
                "Epistemic-audited believed/unverified entry must include \
                 at least one 'Evidence@<commit>' history bullet",
            ));
        }
    }

    violations
}

pub fn validate_workflow_registry(content: &str) -> Vec<Violation> {
    let mut violations = Vec::new();

    for section in parse_sections(content) {
        let heading = &section.heading;
        let Some(entry_id) = extract_id(heading) else {
            continue;
        };

        if !entry_id.starts_with('W') {
            violations.push(Violation::new(
                "workflows",
                Some(entry_id.clone()),
                format!("Non-workflow ID '{entry_id}' in workflow registry"),
            ));
            continue;
        }

        if is_stub(heading) {
            if !WORKFLOW_STUB_RE.is_match(heading) {
                violations.push(Violation::new(
                    "workflows",
                    Some(entry_id),
                    "Stub heading does not match expected pattern: \
                     ## W{NNN}: {name} (SUPERSEDED|MERGED) → {target}",
                ));
            }
            continue;
        }

        if !WORKFLOW_FULL_RE.is_match(heading) {
            violations.push(Violation::new(
                "workflows",
                Some(entry_id),
                "Heading does not match FULL or STUB pattern. Expected: \
                 ## W{NNN}: {name} (CURRENT[ — MODIFIER]) or \
                 ## W{NNN}: {name} (SUPERSEDED|MERGED) → target",
            ));
            continue;
        }

        let body = &section.text;
        if !CONTEXT_RE.is_match(body) {
            violations.push(Violation::new(
                "workflows",
                Some(entry_id.clone()),
                "CURRENT workflow missing required 'Context:' field",
            ));
        }
        if !TRIGGER_RE.is_match(body) && !CURRENT_METHOD_RE.is_match(body) {
            violations.push(Violation::new(
                "workflows",
                Some(entry_id),
                "CURRENT workflow missing required 'Trigger:' or 'Current method:' field",
            ));
        }
    }

    violations
}

pub fn validate_timeline(content: &str) -> Vec<Violation> {
    let mut violations = Vec::new();

    for section in parse_sections(content) {
        if !is_phase_heading(&section.heading) {
            continue;
        }
        if !IDS_LINE_RE.is_match(&section.text) {
            violations.push(Violation::new(
                "timeline",
                None,
                format!(
                    "Phase entry '{}' missing required 'IDs:' line \
                     (use 'IDs: NONE(reason)' when no stable ID applies)",
                    section.heading.trim_start_matches('#').trim()
                ),
            ));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_concept_requires_code_field() {
        let ok = "## C001: Book (ACTIVE)\n\n- **Code:** src/book.rs\n";
        assert!(validate_concept_registry(ok).is_empty());

        let missing = "## C001: Book (ACTIVE)\n\nNothing here.\n";
        let violations = validate_concept_registry(missing);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("Code:"));
    }

    #[test]
    fn concept_modifier_heading_is_full() {
        let doc = "## C003: Matching (ACTIVE — partial rollout)\n\n- **Code:** src/match.rs\n";
        assert!(validate_concept_registry(doc).is_empty());
    }

    #[test]
    fn concept_stub_must_point_somewhere() {
        let ok = "## C002: Old (DEAD) → concept_graveyard.md#C002\n";
        assert!(validate_concept_registry(ok).is_empty());

        // DEAD without arrow is neither FULL nor a valid stub.
        let bad = "## C002: Old (DEAD)\n";
        assert_eq!(validate_concept_registry(bad).len(), 1);
    }

    #[test]
    fn foreign_id_in_registry_is_flagged() {
        let doc = "## E001: Claim (believed)\n\n- **Evidence:** x\n";
        let violations = validate_concept_registry(doc);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("Non-concept"));
    }

    #[test]
    fn epistemic_full_requires_support() {
        let ok = "## E001: Claim (believed)\n\n- **History:** 2026-01-01 confirmed\n";
        assert!(validate_epistemic_state(ok).is_empty());

        let missing = "## E001: Claim (believed)\n\nJust prose.\n";
        let violations = validate_epistemic_state(missing);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("Evidence"));
    }

    #[test]
    fn reaffirmed_believed_history_is_rejected() {
        let doc = "## E001: Claim (believed)\n\n- **History:**\n  - reaffirmed -> believed\n";
        let violations = validate_epistemic_state(doc);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("Evidence@<commit>"));
    }

    #[test]
    fn audited_entry_needs_commit_pinned_evidence() {
        let bad = "## E001: Claim (believed)\n\n- **History:**\n  - Epistemic audit 2026-01-10\n";
        let violations = validate_epistemic_state(bad);
        assert_eq!(violations.len(), 1);

        let ok = "## E001: Claim (believed)\n\n- **History:**\n  \
                  - Epistemic audit 2026-01-10\n- Evidence@abc1234 src/book.rs:10\n";
        assert!(validate_epistemic_state(ok).is_empty());
    }

    #[test]
    fn workflow_full_requires_context_and_method() {
        let ok = "## W001: Release (CURRENT)\n\n- **Context:** weekly\n- **Current method:** tag\n";
        assert!(validate_workflow_registry(ok).is_empty());

        let missing = "## W001: Release (CURRENT)\n\n- **Context:** weekly\n";
        let violations = validate_workflow_registry(missing);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].message.contains("Trigger"));
    }

    #[test]
    fn timeline_phase_requires_ids_line() {
        let ok = "## Phase: Launch (2026-01)\n\nIDs: C001\n";
        assert!(validate_timeline(ok).is_empty());

        let bad = "## Phase: Launch (2026-01)\n\nNo ids here.\n";
        assert_eq!(validate_timeline(bad).len(), 1);
    }
}
