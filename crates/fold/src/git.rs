#![forbid(unsafe_code)]

//! Synchronous git subprocess helpers.
//!
//! Every call blocks on the git exit; failures degrade to `None` so callers
//! can fall back (e.g. orphan checks fall back to the filesystem when the
//! temporal commit cannot be resolved).

use std::path::Path;
use std::process::Command;

/// Run git in `root` and return trimmed stdout on success, `None` otherwise.
pub fn run_git(root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Some(stdout)
}

/// Resolve a `YYYY-MM-DD` day to the latest commit on or before that day.
pub fn resolve_ref_commit(root: &Path, day: &str) -> Option<String> {
    let before = format!("--before={day}T23:59:59");
    let out = run_git(root, &["log", &before, "-1", "--format=%H"])?;
    if out.is_empty() { None } else { Some(out) }
}

/// Whether `path` exists in the tree of `commit`.
pub fn file_exists_at_commit(root: &Path, commit: &str, path: &str) -> bool {
    match run_git(root, &["ls-tree", commit, "--", path]) {
        Some(out) => !out.is_empty(),
        None => false,
    }
}

/// Commit time of `sha` as a unix timestamp (seconds).
pub fn commit_unix_time(root: &Path, sha: &str) -> Option<i64> {
    let out = run_git(root, &["show", "-s", "--format=%ct", sha])?;
    out.lines().next()?.trim().parse().ok()
}

/// Recent commit subjects with their commit times, newest first.
pub fn recent_subjects(root: &Path, count: usize) -> Vec<(i64, String)> {
    let n = count.to_string();
    let Some(out) = run_git(root, &["log", "-n", &n, "--format=%ct\t%s"]) else {
        return Vec::new();
    };
    out.lines()
        .filter_map(|line| {
            let (ts, subject) = line.split_once('\t')?;
            Some((ts.trim().parse().ok()?, subject.to_string()))
        })
        .collect()
}

/// Current HEAD commit hash.
pub fn head_commit(root: &Path) -> Option<String> {
    let out = run_git(root, &["rev-parse", "HEAD"])?;
    if out.is_empty() { None } else { Some(out) }
}

/// Commit hashes in `old..new`, oldest first.
pub fn commits_between(root: &Path, old: &str, new: &str) -> Vec<String> {
    let range = format!("{old}..{new}");
    match run_git(root, &["log", "--reverse", "--format=%H", &range]) {
        Some(out) => out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
        None => Vec::new(),
    }
}

/// File paths changed between two commits.
pub fn changed_files(root: &Path, old: &str, new: &str) -> Vec<String> {
    let range = format!("{old}..{new}");
    match run_git(root, &["diff", "--name-only", &range]) {
        Some(out) => out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
        None => Vec::new(),
    }
}

/// Markdown files tracked by git under the given directories.
pub fn tracked_markdown(root: &Path, dirs: &[String]) -> Vec<String> {
    if dirs.is_empty() {
        return Vec::new();
    }
    let mut args = vec!["ls-files", "--"];
    for dir in dirs {
        args.push(dir.as_str());
    }
    match run_git(root, &args) {
        Some(out) => {
            let mut files: Vec<String> = out
                .lines()
                .map(str::trim)
                .filter(|l| l.ends_with(".md"))
                .map(String::from)
                .collect();
            files.sort();
            files
        }
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_repo(test_name: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let dir = base.join(format!("engram_git_{test_name}_{pid}_{nonce}"));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn git(root: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(root)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    fn commit_all(root: &Path, message: &str, date: &str) {
        git(root, &["add", "-A"]);
        let status = Command::new("git")
            .args(["commit", "-m", message, "--date", date])
            .current_dir(root)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_DATE", date)
            .status()
            .expect("run git commit");
        assert!(status.success(), "git commit failed");
    }

    #[test]
    fn temporal_resolution_and_ls_tree() {
        let root = temp_repo("temporal");
        git(&root, &["init", "-q"]);

        std::fs::write(root.join("early.md"), "early").expect("write");
        commit_all(&root, "early file", "2026-01-10T12:00:00 +0000");

        std::fs::write(root.join("late.md"), "late").expect("write");
        commit_all(&root, "late file", "2026-02-10T12:00:00 +0000");

        let ref_commit = resolve_ref_commit(&root, "2026-01-15").expect("commit at date");
        assert!(file_exists_at_commit(&root, &ref_commit, "early.md"));
        assert!(!file_exists_at_commit(&root, &ref_commit, "late.md"));

        // A date before the first commit resolves to nothing.
        assert!(resolve_ref_commit(&root, "2025-07-01").is_none());

        let head = head_commit(&root).expect("head");
        assert!(commit_unix_time(&root, &head).is_some());
    }

    #[test]
    fn recent_subjects_carry_times() {
        let root = temp_repo("subjects");
        git(&root, &["init", "-q"]);
        std::fs::write(root.join("a.md"), "a").expect("write");
        commit_all(&root, "Knowledge fold: chunk 3", "2026-01-10T12:00:00 +0000");

        let subjects = recent_subjects(&root, 10);
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].1, "Knowledge fold: chunk 3");
        assert!(subjects[0].0 > 0);
    }

    #[test]
    fn outside_a_repo_everything_degrades_to_none() {
        let root = temp_repo("no_repo");
        assert!(head_commit(&root).is_none());
        assert!(resolve_ref_commit(&root, "2026-01-01").is_none());
        assert!(recent_subjects(&root, 5).is_empty());
    }
}
