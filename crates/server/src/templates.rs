#![forbid(unsafe_code)]

//! Schema headers written into fresh living docs and graveyard files.

pub const TIMELINE_HEADER: &str = "\
# Timeline

Chronological narrative of project evolution. References concepts (C###), \
claims (E###), and workflows (W###) by stable ID.
";

pub const CONCEPTS_HEADER: &str = "\
# Concept Registry

Code concepts keyed by stable ID (C###). Status: ACTIVE / DEAD / EVOLVED.
";

pub const EPISTEMIC_HEADER: &str = "\
# Epistemic State

Claims and beliefs keyed by stable ID (E###). \
Status: believed / refuted / contested / unverified.
";

pub const WORKFLOWS_HEADER: &str = "\
# Workflow Registry

Process patterns keyed by stable ID (W###). Status: CURRENT / SUPERSEDED / MERGED.
";

pub const CONCEPT_GRAVEYARD_HEADER: &str = "\
# Concept Graveyard

Append-only archive of DEAD and EVOLVED concept entries. Keyed by stable ID (C###).
";

pub const EPISTEMIC_GRAVEYARD_HEADER: &str = "\
# Epistemic Graveyard

Append-only archive of refuted claims. Keyed by stable ID (E###).
";

pub fn living_header(key: &str) -> &'static str {
    match key {
        "timeline" => TIMELINE_HEADER,
        "concepts" => CONCEPTS_HEADER,
        "epistemic" => EPISTEMIC_HEADER,
        "workflows" => WORKFLOWS_HEADER,
        _ => "",
    }
}

pub fn graveyard_header(key: &str) -> &'static str {
    match key {
        "concept_graveyard" => CONCEPT_GRAVEYARD_HEADER,
        "epistemic_graveyard" => EPISTEMIC_GRAVEYARD_HEADER,
        _ => "",
    }
}
