//! Repository scanner: locate git repositories under a base path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Semaphore;
use typeshare::typeshare;

use crate::core::errors::{OrchestratorError, Result};

use super::validate::safe_path;

/// Directories never descended into
const EXCLUDED_DIRS: &[&str] = &[
    "node_modules",
    ".cache",
    "vendor",
    "__pycache__",
    ".venv",
    "target",
    "dist",
    "build",
];

/// Maximum concurrent directory reads in the fallback scanner
const SCAN_CONCURRENCY: usize = 10;

/// A repository found by the scanner
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoInfo {
    /// Absolute repository path
    #[typeshare(serialized_as = "String")]
    pub path: PathBuf,

    /// Directory name
    pub name: String,

    /// Current branch
    pub branch: String,
}

/// Scan for git repositories under `base_path`, at most `max_depth` levels
/// deep.
///
/// Prefers `fd` when it is on PATH; otherwise falls back to a bounded
/// concurrent walk with the same exclusion set. Results are sorted by path.
pub async fn scan_repos(base_path: &str, max_depth: usize) -> Result<Vec<RepoInfo>> {
    let base = safe_path(base_path)?;
    if !base.is_dir() {
        return Err(OrchestratorError::NotFound {
            what: "Path",
            id: base.display().to_string(),
        });
    }

    let mut repo_dirs = match scan_with_fd(&base, max_depth).await {
        Some(dirs) => dirs,
        None => scan_recursive(&base, max_depth).await,
    };
    repo_dirs.sort();
    repo_dirs.dedup();

    let mut repos = Vec::with_capacity(repo_dirs.len());
    for dir in repo_dirs {
        let name = dir
            .file_name()
            .map_or_else(String::new, |n| n.to_string_lossy().to_string());
        let branch = current_branch(&dir).await.unwrap_or_default();
        repos.push(RepoInfo {
            path: dir,
            name,
            branch,
        });
    }

    Ok(repos)
}

/// Fast path: use `fd` to find `.git` entries. Returns `None` when fd is
/// not installed so the caller can fall back.
async fn scan_with_fd(base: &Path, max_depth: usize) -> Option<Vec<PathBuf>> {
    let mut cmd = Command::new("fd");
    cmd.arg("--hidden")
        .arg("--no-ignore")
        .arg("--absolute-path")
        .arg("--glob")
        .arg("--max-depth")
        // .git sits one level below the repo directory itself
        .arg((max_depth + 1).to_string());
    for excluded in EXCLUDED_DIRS {
        cmd.arg("--exclude").arg(excluded);
    }
    cmd.arg(".git").arg(base);

    let output = match cmd.output().await {
        Ok(o) => o,
        Err(e) => {
            tracing::debug!(error = %e, "fd not available, using fallback scanner");
            return None;
        }
    };

    if !output.status.success() {
        tracing::debug!(
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "fd scan failed, using fallback scanner"
        );
        return None;
    }

    let repos = String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let git_entry = PathBuf::from(line.trim_end_matches('/'));
            if git_entry.file_name()? != ".git" {
                return None;
            }
            git_entry.parent().map(Path::to_path_buf)
        })
        .collect();

    Some(repos)
}

/// Fallback: bounded recursive enumeration with a concurrency cap.
async fn scan_recursive(base: &Path, max_depth: usize) -> Vec<PathBuf> {
    let semaphore = Arc::new(Semaphore::new(SCAN_CONCURRENCY));
    let mut found = Vec::new();
    let mut frontier = vec![(base.to_path_buf(), 0usize)];

    while !frontier.is_empty() {
        let mut tasks = Vec::new();
        for (dir, depth) in frontier.drain(..) {
            let semaphore = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                // Bound how many directory reads are in flight at once
                let _permit = semaphore.acquire().await.ok()?;
                let mut subdirs = Vec::new();
                let mut is_repo = false;

                let mut entries = tokio::fs::read_dir(&dir).await.ok()?;
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let Ok(file_type) = entry.file_type().await else {
                        continue;
                    };
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name == ".git" {
                        is_repo = true;
                    } else if file_type.is_dir()
                        && !name.starts_with('.')
                        && !EXCLUDED_DIRS.contains(&name.as_str())
                        && depth < max_depth
                    {
                        subdirs.push((entry.path(), depth + 1));
                    }
                }

                Some((is_repo.then(|| dir.clone()), subdirs))
            }));
        }

        for task in tasks {
            if let Ok(Some((repo, subdirs))) = task.await {
                if let Some(repo) = repo {
                    found.push(repo);
                }
                frontier.extend(subdirs);
            }
        }
    }

    found
}

/// Current branch of a repository, best effort
async fn current_branch(repo: &Path) -> Option<String> {
    let output = Command::new("git")
        .current_dir(repo)
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .output()
        .await
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_repo(base: &Path, rel: &str) {
        let dir = base.join(rel).join(".git");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("HEAD"), "ref: refs/heads/main").unwrap();
    }

    #[tokio::test]
    async fn test_fallback_scanner_finds_nested_repos() {
        let tmp = TempDir::new().unwrap();
        fake_repo(tmp.path(), "a");
        fake_repo(tmp.path(), "nested/b");

        let found = scan_recursive(tmp.path(), 3).await;
        let mut names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fallback_scanner_respects_depth() {
        let tmp = TempDir::new().unwrap();
        fake_repo(tmp.path(), "l1/l2/l3/l4/deep");

        let found = scan_recursive(tmp.path(), 3).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_scanner_skips_excluded_and_hidden() {
        let tmp = TempDir::new().unwrap();
        fake_repo(tmp.path(), "node_modules/pkg");
        fake_repo(tmp.path(), "target/thing");
        fake_repo(tmp.path(), ".hidden/repo");
        fake_repo(tmp.path(), "ok");

        let found = scan_recursive(tmp.path(), 3).await;
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("ok"));
    }

    #[tokio::test]
    async fn test_scan_repos_sorts_and_validates() {
        let tmp = TempDir::new().unwrap();
        fake_repo(tmp.path(), "zzz");
        fake_repo(tmp.path(), "aaa");

        let repos = scan_repos(&tmp.path().to_string_lossy(), 3).await.unwrap();
        assert_eq!(repos.len(), 2);
        assert!(repos[0].path < repos[1].path);
        assert_eq!(repos[0].name, "aaa");
    }

    #[tokio::test]
    async fn test_scan_repos_rejects_missing_base() {
        let err = scan_repos("/definitely/not/here", 3).await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }
}
