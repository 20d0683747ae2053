#![forbid(unsafe_code)]

//! Chunk input and agent prompt rendering.
//!
//! Plain deterministic string builders. Each chunk is self-contained: the
//! fold agent needs the input file, the prompt file, and the living docs on
//! disk — nothing else.

use std::path::Path;

use crate::drift::DriftReport;
use crate::ids::PreAssigned;
use crate::ChunkType;
use engram_core::DocPaths;

fn pre_assigned_block(pre_assigned: &PreAssigned) -> String {
    let mut out = String::from("## Pre-assigned IDs for this chunk\n\n");
    if pre_assigned.is_empty() {
        out.push_str(
            "None. Do NOT create new entries in this chunk; update existing ones only.\n",
        );
        return out;
    }
    let label = |prefix: &str| match prefix {
        "C" => "Concepts",
        "E" => "Epistemic claims",
        "W" => "Workflows",
        _ => "Other",
    };
    for (prefix, ids) in pre_assigned {
        out.push_str(&format!("- {} ({}): {}\n", label(prefix), prefix, ids.join(", ")));
    }
    out.push_str(
        "\nUse ONLY these IDs for new entries. Unused IDs are simply skipped; \
         never invent IDs outside this list.\n",
    );
    out
}

fn doc_list(doc_paths: &DocPaths) -> String {
    doc_paths
        .living()
        .iter()
        .enumerate()
        .map(|(i, (_, path))| format!("{}. {}", i + 1, path.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn graveyard_list(doc_paths: &DocPaths) -> String {
    doc_paths
        .graveyards()
        .iter()
        .map(|(_, path)| format!("- {}", path.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn fold_instructions(doc_paths: &DocPaths) -> String {
    format!(
        "# Knowledge Fold Instructions\n\
         \n\
         You maintain four living documents:\n\
         \n\
         {docs}\n\
         \n\
         Schema rules:\n\
         - Concepts: `## C{{NNN}}: name (ACTIVE)` with a `Code:` field; \
         DEAD/EVOLVED entries become one-line stubs pointing into the graveyard.\n\
         - Epistemic claims: `## E{{NNN}}: name (believed|contested|unverified)` \
         with `Evidence:` or `History:`; refuted claims become graveyard stubs.\n\
         - Workflows: `## W{{NNN}}: name (CURRENT)` with `Context:` and \
         `Trigger:` or `Current method:`; SUPERSEDED/MERGED entries become stubs.\n\
         - Timeline: phase sections, each carrying an `IDs:` line.\n\
         \n\
         Graveyard files (append-only, never edited in place):\n\
         \n\
         {graveyards}\n",
        docs = doc_list(doc_paths),
        graveyards = graveyard_list(doc_paths),
    )
}

/// Render a fold chunk's `chunk_NNN_input.md`.
pub fn render_chunk_input(
    chunk_id: i64,
    date_range: &str,
    items_content: &str,
    orphan_advisory: &str,
    pre_assigned: &PreAssigned,
    doc_paths: &DocPaths,
) -> String {
    let mut content = fold_instructions(doc_paths);
    content.push('\n');
    content.push_str(&pre_assigned_block(pre_assigned));
    content.push('\n');
    content.push_str(&format!("# New Content ({date_range})\n# Chunk {chunk_id}\n\n"));
    if !orphan_advisory.is_empty() {
        content.push_str(orphan_advisory);
    }
    content.push_str(items_content);
    content
}

fn triage_title(chunk_type: ChunkType) -> &'static str {
    match chunk_type {
        ChunkType::ConceptTriage => "Concept Triage: orphaned ACTIVE concepts",
        ChunkType::ContestedReview => "Contested Review: long-contested claims",
        ChunkType::StaleUnverified => "Stale Unverified: claims needing verification or demotion",
        ChunkType::WorkflowSynthesis => "Workflow Synthesis: consolidate CURRENT workflows",
        ChunkType::Fold => "Fold",
    }
}

fn triage_task(chunk_type: ChunkType) -> &'static str {
    match chunk_type {
        ChunkType::ConceptTriage => {
            "For each concept below, every referenced code path is missing. Decide \
             whether the concept is DEAD (stub it into the graveyard) or whether its \
             Code: field should point at the files that replaced the old paths."
        }
        ChunkType::ContestedReview => {
            "Each claim below has been contested longer than the review window. \
             Resolve it: gather the deciding evidence and move the claim to believed \
             or refuted (refuted claims become graveyard stubs)."
        }
        ChunkType::StaleUnverified => {
            "Each claim below has sat unverified past the staleness window. Verify it \
             against the current code and promote to believed, or refute it."
        }
        ChunkType::WorkflowSynthesis => {
            "The registry has accumulated more CURRENT workflows than the repetition \
             threshold. Merge overlapping workflows (mark the absorbed ones MERGED with \
             stubs) and supersede obsolete ones so the CURRENT set shrinks."
        }
        ChunkType::Fold => "",
    }
}

/// Render a drift-triage chunk's `chunk_NNN_input.md`.
pub fn render_triage_input(
    chunk_type: ChunkType,
    report: &DriftReport,
    chunk_id: i64,
    doc_paths: &DocPaths,
    ref_commit: Option<&str>,
    ref_date: Option<&str>,
) -> String {
    let mut content = fold_instructions(doc_paths);
    content.push('\n');
    content.push_str(&format!(
        "# {title}\n# Chunk {chunk_id}\n\n{task}\n\n",
        title = triage_title(chunk_type),
        task = triage_task(chunk_type),
    ));

    if let (Some(commit), Some(date)) = (ref_commit, ref_date) {
        content.push_str(&format!(
            "**Temporal context:** living docs are current through {date} \
             (commit `{short}`). Check file existence against that commit \
             (`git ls-tree {short} -- <path>`), not today's working tree.\n\n",
            short = &commit[..commit.len().min(12)],
        ));
    }

    match chunk_type {
        ChunkType::ConceptTriage => {
            for orphan in &report.orphaned_concepts {
                content.push_str(&format!(
                    "- **{}**: missing paths: {}\n",
                    orphan.name,
                    orphan.paths.join(", ")
                ));
            }
        }
        ChunkType::ContestedReview => {
            for claim in &report.contested_claims {
                content.push_str(&format!(
                    "- **{}**: contested for {} days (last activity {})\n",
                    claim.name, claim.days_old, claim.last_date
                ));
            }
        }
        ChunkType::StaleUnverified => {
            for claim in &report.stale_unverified {
                content.push_str(&format!(
                    "- **{}**: unverified for {} days (last activity {})\n",
                    claim.name, claim.days_old, claim.last_date
                ));
            }
        }
        ChunkType::WorkflowSynthesis => {
            for workflow in &report.workflow_repetitions {
                content.push_str(&format!("- **{}**\n", workflow.name));
            }
        }
        ChunkType::Fold => {}
    }

    content.push_str(&format!(
        "\n({} entries)\n",
        report.entry_count(chunk_type)
    ));
    content
}

/// Render the `chunk_NNN_prompt.txt` agent execution prompt.
pub fn render_agent_prompt(
    chunk_id: i64,
    date_range: &str,
    input_path: &Path,
    doc_paths: &DocPaths,
    project_root: &Path,
) -> String {
    format!(
        "You are processing a knowledge fold chunk.\n\
         \n\
         IMPORTANT CONSTRAINTS:\n\
         - Do NOT use the Task tool or spawn sub-agents. Do all work directly.\n\
         - Do NOT use Write to overwrite entire files. Use Edit for surgical updates only.\n\
         - Be SUCCINCT. High information density, no filler, no narrative prose.\n\
         - Use only the input file + living docs; do NOT inspect source code unless \
         the input file explicitly says otherwise.\n\
         \n\
         Read the input file at {input} — it contains system instructions\n\
         and new content covering {date_range} (chunk {chunk_id}).\n\
         \n\
         Follow the instructions in that file. Update these 4 living documents:\n\
         \n\
         {docs}\n\
         \n\
         Graveyard files (append-only — do NOT read these; append new entries only):\n\
         \n\
         {graveyards}\n\
         \n\
         Read each living doc first, then make surgical edits based on the chunk content.\n\
         \n\
         Rules:\n\
         - Extract concepts, claims, timeline events, workflows from the chunk\n\
         - Every timeline phase entry must include 'IDs:' with C###/E###/W### \
         or 'IDs: NONE(reason)' when no stable ID applies.\n\
         - USER PROMPTS encode the project owner's intent — they are authoritative\n\
         - DEAD/refuted entries: 1-2 sentences max. Key lesson + what replaced it.\n\
         - Process ALL items in the chunk\n\
         - Use ONLY IDs listed under 'Pre-assigned IDs for this chunk'. If none are \
         listed, do NOT create new IDs in this chunk.\n\
         \n\
         After All Edits: Lint Check (Required)\n\
         \n\
         Run the linter after completing all edits:\n  \
         engram lint --project-root \"{root}\"\n\
         Fix every violation reported. Re-run until lint passes with 0 violations.\n\
         Do not stop until lint is clean.\n",
        input = input_path.display(),
        docs = doc_list(doc_paths),
        graveyards = graveyard_list(doc_paths),
        root = project_root.display(),
    )
}

/// Render the bootstrap seed prompt body written to `seed_input.md`.
pub fn render_seed_input(doc_paths: &DocPaths, pre_assigned: &PreAssigned) -> String {
    let mut content = fold_instructions(doc_paths);
    content.push('\n');
    content.push_str(&pre_assigned_block(pre_assigned));
    content.push_str(
        "\n# Seed Task\n\n\
         Populate the four living documents from the repository snapshot below. \
         Extract the concepts that structure the codebase, the claims the project \
         currently operates on, the workflows its contributors repeat, and a \
         first timeline phase. Be succinct: 5 lines per entry ideal, 10 max.\n",
    );
    content
}
