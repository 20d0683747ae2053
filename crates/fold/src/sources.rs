#![forbid(unsafe_code)]

//! Issue and document source adapters.
//!
//! All functions here are pure with respect to the state store: they read the
//! filesystem and git, and render artifacts, but never write durable state.

use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;

use crate::FoldError;
use crate::git;
use engram_core::Config;

static FRONTMATTER_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*Date:\*\*\s*(\d{4}-\d{2}-\d{2})").expect("FRONTMATTER_DATE_RE should compile")
});
static ISSUE_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)_").expect("ISSUE_NUMBER_RE should compile"));
static GITHUB_REMOTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"github\.com[:/]([^/\s]+/[^/\s]+?)(?:\.git)?$")
        .expect("GITHUB_REMOTE_RE should compile")
});

/// Render a GitHub issue JSON object as clean markdown.
pub fn render_issue_markdown(issue: &Value) -> String {
    let mut parts: Vec<String> = Vec::new();

    let state = issue
        .get("state")
        .and_then(Value::as_str)
        .unwrap_or("UNKNOWN");
    let labels: Vec<&str> = issue
        .get("labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|l| l.get("name").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    let mut meta = format!("**State:** {state}");
    if !labels.is_empty() {
        meta.push_str(&format!(" | **Labels:** {}", labels.join(", ")));
    }
    parts.push(meta);
    parts.push(String::new());

    let body = issue.get("body").and_then(Value::as_str).unwrap_or("");
    parts.push(body.to_string());

    if let Some(comments) = issue.get("comments").and_then(Value::as_array) {
        if !comments.is_empty() {
            parts.push(String::new());
            parts.push("### Comments".to_string());
            parts.push(String::new());
            for comment in comments {
                let author = comment
                    .get("author")
                    .and_then(|a| a.get("login"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let date = comment
                    .get("createdAt")
                    .and_then(Value::as_str)
                    .map(|d| engram_core::dates::day_of(d).to_string())
                    .unwrap_or_default();
                let body = comment.get("body").and_then(Value::as_str).unwrap_or("");
                parts.push(format!("**{author}** ({date}):"));
                parts.push(String::new());
                parts.push(body.to_string());
                parts.push(String::new());
            }
        }
    }

    parts.join("\n")
}

/// Pull all GitHub issues with comments into local JSON snapshots.
///
/// Returns the number of issues written.
pub fn pull_issues(repo: &str, issues_dir: &Path) -> Result<usize, FoldError> {
    std::fs::create_dir_all(issues_dir)?;

    let output = Command::new("gh")
        .args([
            "issue",
            "list",
            "--repo",
            repo,
            "--state",
            "all",
            "--json",
            "number,title,body,createdAt,updatedAt,state,labels,comments",
            "--limit",
            "5000",
        ])
        .output()
        .map_err(|err| FoldError::IssueRefresh(format!("could not run gh: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FoldError::IssueRefresh(format!(
            "gh issue list failed for {repo}: {}",
            stderr.trim()
        )));
    }

    let issues: Vec<Value> = serde_json::from_slice(&output.stdout)?;
    for issue in &issues {
        let Some(number) = issue.get("number").and_then(Value::as_i64) else {
            continue;
        };
        let path = issues_dir.join(format!("{number}.json"));
        std::fs::write(&path, serde_json::to_string_pretty(issue)?)?;
    }
    Ok(issues.len())
}

/// Infer `owner/repo` from the git origin remote.
pub fn infer_github_repo(project_root: &Path) -> Option<String> {
    let url = git::run_git(project_root, &["remote", "get-url", "origin"])?;
    GITHUB_REMOTE_RE
        .captures(&url)
        .map(|caps| caps[1].to_string())
}

/// Refresh `sources.issues` snapshots from GitHub.
///
/// Returns `(ok, message)`; a missing repo resolution is a soft skip so local
/// snapshots keep working offline.
pub fn refresh_issue_snapshots(config: &Config, project_root: &Path) -> (bool, String) {
    if !config.sources.refresh_issues {
        return (
            true,
            "disabled by config (sources.refresh_issues: false)".to_string(),
        );
    }

    let issues_dir = project_root.join(&config.sources.issues);
    let repo = config
        .sources
        .github_repo
        .clone()
        .or_else(|| infer_github_repo(project_root));
    let Some(repo) = repo else {
        return (
            true,
            "unable to resolve GitHub repo (set sources.github_repo or configure \
             git remote.origin.url); using local issue snapshots"
                .to_string(),
        );
    };

    match pull_issues(&repo, &issues_dir) {
        Ok(count) => (true, format!("refreshed {count} issues from {repo}")),
        Err(err) => (false, err.to_string()),
    }
}

/// First-commit and last-commit author dates for a doc, as ISO strings.
///
/// The first commit follows renames (`--follow --diff-filter=A`); the last
/// commit is taken on the current path.
pub fn doc_git_dates(doc_path: &Path, project_root: &Path) -> (Option<String>, Option<String>) {
    let Ok(rel_path) = doc_path.strip_prefix(project_root) else {
        return (None, None);
    };
    let rel = rel_path.to_string_lossy();

    let created = git::run_git(
        project_root,
        &[
            "log",
            "--all",
            "--follow",
            "--diff-filter=A",
            "--reverse",
            "--format=%aI",
            "--",
            rel.as_ref(),
        ],
    )
    .and_then(|out| {
        out.lines()
            .map(str::trim)
            .find(|line| line.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .map(String::from)
    });

    let modified = git::run_git(
        project_root,
        &["log", "-1", "--format=%aI", "--", rel.as_ref()],
    )
    .and_then(|out| {
        let trimmed = out.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    });

    (created, modified)
}

/// Extract a date from doc frontmatter like `**Date:** 2026-02-08`.
///
/// Dates before `project_start` are treated as typos and discarded.
pub fn parse_frontmatter_date(doc_path: &Path, project_start: Option<&str>) -> Option<String> {
    let content = std::fs::read_to_string(doc_path).ok()?;
    let head: String = content.chars().take(2000).collect();
    let caps = FRONTMATTER_DATE_RE.captures(&head)?;
    let date = caps[1].to_string();
    if let Some(start) = project_start {
        if date.as_str() < start {
            return None;
        }
    }
    Some(format!("{date}T00:00:00+00:00"))
}

/// Extract an issue number from filenames like `1343_backtest_analysis.md`.
pub fn extract_issue_number(doc_path: &Path) -> Option<i64> {
    let name = doc_path.file_name()?.to_string_lossy().to_string();
    ISSUE_NUMBER_RE
        .captures(&name)
        .and_then(|caps| caps[1].parse().ok())
}

/// Markdown docs under the configured source dirs: git-tracked files when the
/// root is a repository, a plain directory listing otherwise.
pub fn list_markdown_docs(project_root: &Path, doc_dirs: &[String]) -> Vec<PathBuf> {
    let tracked = git::tracked_markdown(project_root, doc_dirs);
    if !tracked.is_empty() {
        return tracked
            .into_iter()
            .map(|rel| project_root.join(rel))
            .collect();
    }

    let mut docs = Vec::new();
    for dir in doc_dirs {
        let dir_path = project_root.join(dir);
        let Ok(entries) = std::fs::read_dir(&dir_path) else {
            continue;
        };
        let mut found: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        found.sort();
        docs.extend(found);
    }
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir(test_name: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = base.join(format!("engram_sources_{test_name}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn issue_markdown_includes_state_labels_comments() {
        let issue = json!({
            "number": 12,
            "state": "OPEN",
            "title": "Fix the thing",
            "body": "It is broken.",
            "labels": [{"name": "bug"}, {"name": "p1"}],
            "comments": [
                {"author": {"login": "alice"}, "createdAt": "2026-01-05T10:00:00Z", "body": "On it."}
            ]
        });
        let rendered = render_issue_markdown(&issue);
        assert!(rendered.contains("**State:** OPEN | **Labels:** bug, p1"));
        assert!(rendered.contains("It is broken."));
        assert!(rendered.contains("**alice** (2026-01-05):"));
    }

    #[test]
    fn issue_markdown_tolerates_missing_fields() {
        let rendered = render_issue_markdown(&json!({"number": 3}));
        assert!(rendered.contains("**State:** UNKNOWN"));
        assert!(!rendered.contains("### Comments"));
    }

    #[test]
    fn frontmatter_date_respects_project_start() {
        let dir = temp_dir("frontmatter");
        let doc = dir.join("note.md");
        std::fs::write(&doc, "# Note\n\n**Date:** 2025-03-01\n\nBody.\n").expect("write");

        assert_eq!(
            parse_frontmatter_date(&doc, None).as_deref(),
            Some("2025-03-01T00:00:00+00:00")
        );
        // Before project start — treated as a typo.
        assert_eq!(parse_frontmatter_date(&doc, Some("2025-06-01")), None);
    }

    #[test]
    fn issue_number_from_filename() {
        assert_eq!(
            extract_issue_number(Path::new("docs/1343_backtest_analysis.md")),
            Some(1343)
        );
        assert_eq!(extract_issue_number(Path::new("docs/notes.md")), None);
    }

    #[test]
    fn github_remote_parsing() {
        for url in [
            "git@github.com:acme/widgets.git",
            "https://github.com/acme/widgets.git",
            "https://github.com/acme/widgets",
        ] {
            let caps = GITHUB_REMOTE_RE.captures(url).expect("match");
            assert_eq!(&caps[1], "acme/widgets", "url: {url}");
        }
    }

    #[test]
    fn directory_listing_fallback_is_sorted() {
        let dir = temp_dir("listing");
        let docs_dir = dir.join("docs");
        std::fs::create_dir_all(&docs_dir).expect("mkdir");
        std::fs::write(docs_dir.join("b.md"), "b").expect("write");
        std::fs::write(docs_dir.join("a.md"), "a").expect("write");
        std::fs::write(docs_dir.join("skip.txt"), "x").expect("write");

        let docs = list_markdown_docs(&dir, &["docs".to_string()]);
        let names: Vec<String> = docs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.md", "b.md"]);
    }
}
