#![forbid(unsafe_code)]

//! L0 briefing regeneration.
//!
//! Compresses the living docs into a short briefing section of the project's
//! agent-instructions file via a fast model call. Regeneration is deferred
//! to queue drain; the server loop owns that timing and the staleness flag.

use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

use engram_core::{Config, DocPaths};

/// Per-doc cap fed into the briefing prompt; very large docs are truncated.
const DOC_CAP_CHARS: usize = 10_000;

/// Regenerate the briefing section in the configured target file.
/// Returns whether regeneration succeeded (the caller clears the staleness
/// flag only on success).
pub fn regenerate_l0_briefing(config: &Config, project_root: &Path, doc_paths: &DocPaths) -> bool {
    let target_file = project_root.join(&config.briefing.file);
    if !target_file.exists() {
        warn!(target = %target_file.display(), "briefing target file not found");
        return false;
    }

    let mut living_contents = Vec::new();
    for (key, path) in doc_paths.living() {
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        let capped = if content.len() > DOC_CAP_CHARS {
            let truncated: String = content.chars().take(DOC_CAP_CHARS).collect();
            format!("{truncated}\n\n[... truncated for briefing ...]\n")
        } else {
            content
        };
        living_contents.push(format!("### {key}\n{capped}"));
    }
    if living_contents.is_empty() {
        return false;
    }

    let Some(briefing) = generate_briefing(config, project_root, &living_contents.join("\n\n"))
    else {
        warn!("L0 briefing generation returned empty result");
        return false;
    };

    if let Err(err) = inject_section(&target_file, &config.briefing.section, &briefing) {
        warn!(%err, "could not write briefing section");
        return false;
    }
    info!(target = %target_file.display(), "L0 briefing regenerated");
    true
}

/// Shell out to a fast model for the compression. An explicit agent_command
/// override is honoured; the default pins the cheap model tier.
fn generate_briefing(config: &Config, project_root: &Path, living_docs: &str) -> Option<String> {
    let prompt = format!(
        "Compress the following project knowledge into a concise briefing \
         (50-100 lines). Focus on: what's alive vs dead, contested claims, \
         key workflows, and agent guidance. Use stable IDs (C###/E###/W###) \
         and add a short inline gloss when an ID is first introduced, so each \
         line is understandable without opening other files.\n\n{living_docs}"
    );

    let argv = match &config.agent_command {
        Some(cmd) => cmd.clone(),
        None => vec![
            "claude".to_string(),
            "--print".to_string(),
            "--model".to_string(),
            "haiku".to_string(),
        ],
    };
    let (program, args) = argv.split_first()?;

    let output = Command::new(program)
        .args(args)
        .arg(prompt)
        .current_dir(project_root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

/// Inject or replace a section in a file: find `section_header` and replace
/// everything until the next same-level (or higher) heading; append the
/// section when absent.
pub fn inject_section(
    file_path: &Path,
    section_header: &str,
    content: &str,
) -> std::io::Result<()> {
    let text = std::fs::read_to_string(file_path)?;
    let header_level = section_header.chars().take_while(|c| *c == '#').count();

    let new_text = match text.find(section_header) {
        None => {
            let mut out = text;
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&format!("\n{section_header}\n\n{content}\n"));
            out
        }
        Some(start) => {
            let after_header = start + section_header.len();
            let rest = &text[after_header..];

            let mut end_offset = rest.len();
            let mut scanned = 0usize;
            for (i, line) in rest.split('\n').enumerate() {
                if i > 0 {
                    let stripped = line.trim_start();
                    if stripped.starts_with('#') {
                        let level = stripped.chars().take_while(|c| *c == '#').count();
                        if level <= header_level {
                            end_offset = scanned;
                            break;
                        }
                    }
                }
                scanned += line.len() + 1;
            }

            format!(
                "{}{section_header}\n\n{content}\n{}",
                &text[..start],
                &rest[end_offset.min(rest.len())..]
            )
        }
    };

    std::fs::write(file_path, new_text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(test_name: &str, content: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = base.join(format!("engram_briefing_{test_name}_{pid}_{nonce}.md"));
        std::fs::write(&path, content).expect("write temp file");
        path
    }

    #[test]
    fn inject_appends_when_section_absent() {
        let path = temp_file("append", "# Project\n\nIntro.\n");
        inject_section(&path, "## Project Knowledge Briefing", "Briefing body.")
            .expect("inject");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("## Project Knowledge Briefing\n\nBriefing body.\n"));
        assert!(text.starts_with("# Project"));
    }

    #[test]
    fn inject_replaces_existing_section_up_to_next_heading() {
        let path = temp_file(
            "replace",
            "# Project\n\n## Project Knowledge Briefing\n\nOld body.\n\nMore old.\n\n## Next Section\n\nKeep me.\n",
        );
        inject_section(&path, "## Project Knowledge Briefing", "New body.").expect("inject");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("New body."));
        assert!(!text.contains("Old body."));
        assert!(text.contains("## Next Section\n\nKeep me."));
    }

    #[test]
    fn inject_replaces_trailing_section() {
        let path = temp_file(
            "trailing",
            "# Project\n\n## Project Knowledge Briefing\n\nOld tail.\n",
        );
        inject_section(&path, "## Project Knowledge Briefing", "Fresh tail.").expect("inject");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("Fresh tail."));
        assert!(!text.contains("Old tail."));
    }

    #[test]
    fn deeper_subsections_are_replaced_with_the_section() {
        let path = temp_file(
            "subsections",
            "## Project Knowledge Briefing\n\nOld.\n\n### Detail\n\nOld detail.\n\n## After\n\nStays.\n",
        );
        inject_section(&path, "## Project Knowledge Briefing", "New.").expect("inject");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(!text.contains("Old detail."));
        assert!(text.contains("## After\n\nStays."));
    }
}
