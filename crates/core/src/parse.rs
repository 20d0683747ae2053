#![forbid(unsafe_code)]

//! Shared markdown parsing for living docs.
//!
//! Living docs are flat H2-section documents. Entries carry stable IDs
//! (`C042`, `E007`, `W003`) in their headings; compacted entries remain as
//! one-line pointer stubs into a graveyard file. Nothing here builds an
//! object graph — callers get flat sections and resolve references later.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Matches status annotations in headings like `## Name (DEAD)` or
/// `## Name (EVOLVED → C089)`.
static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\((DEAD|refuted|EVOLVED[^)]*|CONTESTED|believed|unverified|CURRENT|SUPERSEDED[^)]*|MERGED[^)]*)\)\s*$",
    )
    .expect("STATUS_RE should compile")
});

/// Matches stable ID prefixes: `## C042: …`.
static STABLE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^##\s+([CEW]\d{3,}):\s+").expect("STABLE_ID_RE should compile"));

/// Matches graveyard pointer stubs: `## C012: name (DEAD) → concept_graveyard.md#C012`.
static STUB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##\s+([CEW]\d{3,}):.+→\s+(\S+)$").expect("STUB_RE should compile")
});

/// Matches phase headings in the timeline: `## Phase: Name (Period)`.
static PHASE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^##\s+Phase:\s+(.+)$").expect("PHASE_RE should compile"));

static REFERENCED_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([CEW]\d{3,})\b").expect("REFERENCED_ID_RE should compile"));

/// Stable identifier category. Each category owns an independent monotonic
/// counter and a home living document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdCategory {
    Concept,
    Epistemic,
    Workflow,
}

impl IdCategory {
    pub const ALL: [IdCategory; 3] = [Self::Concept, Self::Epistemic, Self::Workflow];

    pub fn prefix(self) -> char {
        match self {
            Self::Concept => 'C',
            Self::Epistemic => 'E',
            Self::Workflow => 'W',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Concept => "C",
            Self::Epistemic => "E",
            Self::Workflow => "W",
        }
    }

    pub fn from_prefix(c: char) -> Option<Self> {
        match c {
            'C' => Some(Self::Concept),
            'E' => Some(Self::Epistemic),
            'W' => Some(Self::Workflow),
            _ => None,
        }
    }

    /// Format a numeric id as a stable identifier string, e.g. `C042`.
    pub fn format_id(self, n: i64) -> String {
        format!("{}{:03}", self.prefix(), n)
    }
}

/// A parsed H2 section from a markdown document.
#[derive(Clone, Debug)]
pub struct Section {
    /// Full heading line, including the `## ` prefix.
    pub heading: String,
    /// Lowercased first word of the trailing status annotation, if any.
    /// `(ACTIVE)` is deliberately not a recognized annotation — ACTIVE
    /// entries report `None`.
    pub status: Option<String>,
    /// Line index of the heading in the source document.
    pub start: usize,
    /// One past the last line of the section.
    pub end: usize,
    /// Full section text, heading included.
    pub text: String,
}

/// Parse a markdown doc into H2 sections with their status annotation.
///
/// Preamble lines before the first `## ` heading are not part of any section.
pub fn parse_sections(content: &str) -> Vec<Section> {
    let lines: Vec<&str> = content.split('\n').collect();
    let mut sections = Vec::new();
    let mut current: Option<(String, Option<String>, usize)> = None;

    for (i, line) in lines.iter().enumerate() {
        if !line.starts_with("## ") {
            continue;
        }
        if let Some((heading, status, start)) = current.take() {
            sections.push(Section {
                heading,
                status,
                start,
                end: i,
                text: lines[start..i].join("\n"),
            });
        }
        let status = STATUS_RE.captures(line).and_then(|caps| {
            caps.get(1).map(|m| {
                m.as_str()
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_lowercase()
            })
        });
        current = Some((line.to_string(), status, i));
    }

    if let Some((heading, status, start)) = current {
        sections.push(Section {
            heading,
            status,
            start,
            end: lines.len(),
            text: lines[start..].join("\n"),
        });
    }

    sections
}

/// Extract a stable ID (e.g. `C042`) from an H2 heading line.
pub fn extract_id(heading: &str) -> Option<String> {
    STABLE_ID_RE
        .captures(heading)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Numeric part of a stable ID string, e.g. `C042` → 42.
pub fn id_number(id: &str) -> Option<i64> {
    id.get(1..).and_then(|digits| digits.parse().ok())
}

/// Whether a heading is a graveyard pointer stub.
pub fn is_stub(heading: &str) -> bool {
    STUB_RE.is_match(heading)
}

/// Extract `(id, target)` from a stub heading, or `None` for non-stubs.
pub fn extract_stub_target(heading: &str) -> Option<(String, String)> {
    let caps = STUB_RE.captures(heading)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// Whether a heading is a timeline phase heading.
pub fn is_phase_heading(heading: &str) -> bool {
    PHASE_RE.is_match(heading)
}

/// Find all stable ID references (`C###`, `E###`, `W###`) in text.
pub fn extract_referenced_ids(text: &str) -> BTreeSet<String> {
    REFERENCED_ID_RE
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "\
# Concept Registry

Preamble text.

## C001: Order book (ACTIVE)

- **Code:** src/book.rs

## C002: Legacy matcher (DEAD) → concept_graveyard.md#C002

## E001: Fills are atomic (believed)

- **Evidence:** tests pass
";

    #[test]
    fn parse_sections_splits_on_h2() {
        let sections = parse_sections(DOC);
        assert_eq!(sections.len(), 3);
        assert_eq!(extract_id(&sections[0].heading).as_deref(), Some("C001"));
        assert!(sections[0].text.contains("src/book.rs"));
        assert_eq!(sections[2].end, DOC.lines().count());
    }

    #[test]
    fn status_is_lowercased_first_word() {
        let sections = parse_sections(DOC);
        // ACTIVE is not a recognized status annotation.
        assert_eq!(sections[0].status, None);
        assert_eq!(sections[1].status.as_deref(), Some("dead"));
        assert_eq!(sections[2].status.as_deref(), Some("believed"));
    }

    #[test]
    fn evolved_status_with_target_keeps_first_word() {
        let sections =
            parse_sections("## C004: Old (EVOLVED → C009) → concept_graveyard.md#C004\n");
        assert_eq!(sections[0].status.as_deref(), Some("evolved"));
        assert!(is_stub(&sections[0].heading));
    }

    #[test]
    fn stub_detection_and_target() {
        assert!(is_stub(
            "## C002: Legacy matcher (DEAD) → concept_graveyard.md#C002"
        ));
        assert!(!is_stub("## C001: Order book (ACTIVE)"));
        let (id, target) =
            extract_stub_target("## E003: Wrong claim (refuted) → epistemic_graveyard.md#E003")
                .expect("stub target");
        assert_eq!(id, "E003");
        assert_eq!(target, "epistemic_graveyard.md#E003");
    }

    #[test]
    fn referenced_ids_are_collected() {
        let refs = extract_referenced_ids("See C001 and E007; W003 superseded W002.");
        let expected = vec!["C001", "E007", "W002", "W003"];
        assert_eq!(
            refs.iter().map(String::as_str).collect::<Vec<_>>(),
            expected
        );
    }

    #[test]
    fn id_number_parses_digits() {
        assert_eq!(id_number("C042"), Some(42));
        assert_eq!(id_number("W1204"), Some(1204));
        assert_eq!(id_number(""), None);
    }

    #[test]
    fn four_digit_ids_are_accepted() {
        assert_eq!(
            extract_id("## C1042: Big registry entry (ACTIVE)").as_deref(),
            Some("C1042")
        );
    }
}
