//! Safe wrappers over `git worktree`.

use std::path::{Path, PathBuf};
use tokio::process::Command;

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::core::errors::{OrchestratorError, Result};
use crate::utils::worktree_id;

use super::validate::{safe_branch, safe_path};

/// One entry from the porcelain worktree listing
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worktree {
    /// Stable id derived from the path
    pub id: String,

    /// Absolute worktree path
    #[typeshare(serialized_as = "String")]
    pub path: PathBuf,

    /// Branch name, or `(detached)`
    pub branch: String,

    /// HEAD commit hash
    pub commit: String,

    /// Whether this is the main worktree
    pub is_main: bool,

    /// Whether this is a bare checkout
    pub is_bare: bool,
}

/// Safe wrappers over the `git worktree` CLI.
///
/// Every operation validates its arguments before any subprocess is spawned.
#[derive(Debug, Clone, Default)]
pub struct WorktreeService;

impl WorktreeService {
    /// Create a new worktree service
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Check whether a path is the working tree of a git repository
    pub async fn is_repo(&self, repo_path: &str) -> Result<bool> {
        let path = safe_path(repo_path)?;
        if !path.is_dir() {
            return Ok(false);
        }

        let output = Command::new("git")
            .current_dir(&path)
            .args(["rev-parse", "--is-inside-work-tree"])
            .output()
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        Ok(output.status.success()
            && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    /// List all worktrees of a repository.
    ///
    /// The first porcelain entry is the main worktree; `refs/heads/<n>` is
    /// stripped to `<n>`; a detached entry yields branch `(detached)`.
    pub async fn list(&self, repo_path: &str) -> Result<Vec<Worktree>> {
        let path = self.require_repo(repo_path).await?;

        let output = Command::new("git")
            .current_dir(&path)
            .args(["worktree", "list", "--porcelain"])
            .output()
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        if !output.status.success() {
            return Err(OrchestratorError::Git {
                operation: "worktree list".to_string(),
                repo: path,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_porcelain(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Create a new worktree on a new branch.
    ///
    /// The destination is `<repoRoot>-<branch>` with `/` in the branch
    /// replaced by `-`. Fails with `Conflict` if the destination exists.
    pub async fn create(
        &self,
        repo_path: &str,
        branch: &str,
        base_branch: Option<&str>,
    ) -> Result<Worktree> {
        let repo = self.require_repo(repo_path).await?;
        safe_branch(branch)?;
        let base = match base_branch {
            Some(b) => safe_branch(b)?,
            None => "HEAD",
        };

        let root = repo_root(&repo).await?;
        let dest = worktree_destination(&root, branch);
        if dest.exists() {
            return Err(OrchestratorError::Conflict {
                reason: format!("destination already exists: {}", dest.display()),
            });
        }

        let output = Command::new("git")
            .current_dir(&repo)
            .args(["worktree", "add", "-b", branch])
            .arg(&dest)
            .arg(base)
            .output()
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!(
                repo = %repo.display(),
                branch,
                dest = %dest.display(),
                stderr = %stderr,
                "Failed to create worktree"
            );
            return Err(OrchestratorError::Git {
                operation: "worktree add".to_string(),
                repo,
                stderr,
            });
        }

        tracing::info!(
            repo = %repo.display(),
            branch,
            dest = %dest.display(),
            "Created worktree"
        );

        // Return the authoritative entry from a re-list
        let created = self
            .list(repo_path)
            .await?
            .into_iter()
            .find(|w| w.path == dest)
            .ok_or_else(|| OrchestratorError::NotFound {
                what: "Worktree",
                id: dest.display().to_string(),
            })?;

        Ok(created)
    }

    /// Remove a worktree and best-effort delete its branch.
    ///
    /// Refuses to delete the main worktree.
    pub async fn delete(&self, repo_path: &str, worktree_path: &str) -> Result<()> {
        let repo = self.require_repo(repo_path).await?;
        let target = safe_path(worktree_path)?;

        let worktrees = self.list(repo_path).await?;
        let entry = worktrees
            .iter()
            .find(|w| w.path == target)
            .ok_or_else(|| OrchestratorError::NotFound {
                what: "Worktree",
                id: target.display().to_string(),
            })?;
        if entry.is_main {
            return Err(OrchestratorError::invalid(
                "cannot delete the main worktree",
            ));
        }
        let branch = entry.branch.clone();

        let output = Command::new("git")
            .current_dir(&repo)
            .args(["worktree", "remove"])
            .arg(&target)
            .arg("--force")
            .output()
            .await
            .map_err(|e| OrchestratorError::Internal(e.into()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(OrchestratorError::Git {
                operation: "worktree remove".to_string(),
                repo,
                stderr,
            });
        }

        // Best-effort branch cleanup; the worktree itself is already gone
        if branch != "(detached)" {
            let output = Command::new("git")
                .current_dir(&repo)
                .args(["branch", "-D", &branch])
                .output()
                .await
                .map_err(|e| OrchestratorError::Internal(e.into()))?;
            if !output.status.success() {
                tracing::warn!(
                    branch,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Failed to delete worktree branch"
                );
            }
        }

        tracing::info!(worktree = %target.display(), "Deleted worktree");
        Ok(())
    }

    /// Validate that the path exists and is a repository, returning it
    /// in absolute form.
    async fn require_repo(&self, repo_path: &str) -> Result<PathBuf> {
        let path = safe_path(repo_path)?;
        if !path.exists() {
            return Err(OrchestratorError::NotFound {
                what: "Path",
                id: path.display().to_string(),
            });
        }
        if !self.is_repo(repo_path).await? {
            return Err(OrchestratorError::invalid(format!(
                "not a git repository: {}",
                path.display()
            )));
        }
        Ok(path)
    }
}

/// Compute the destination directory for a new worktree
fn worktree_destination(repo_root: &Path, branch: &str) -> PathBuf {
    let flat = branch.replace('/', "-");
    let name = repo_root
        .file_name()
        .map_or_else(|| "repo".to_string(), |n| n.to_string_lossy().to_string());
    repo_root.with_file_name(format!("{name}-{flat}"))
}

/// Resolve the top-level directory of a repository
async fn repo_root(repo: &Path) -> Result<PathBuf> {
    let output = Command::new("git")
        .current_dir(repo)
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .await
        .map_err(|e| OrchestratorError::Internal(e.into()))?;

    if !output.status.success() {
        return Err(OrchestratorError::Git {
            operation: "rev-parse --show-toplevel".to_string(),
            repo: repo.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(PathBuf::from(
        String::from_utf8_lossy(&output.stdout).trim(),
    ))
}

/// Parse `git worktree list --porcelain` output
fn parse_porcelain(text: &str) -> Vec<Worktree> {
    let mut result = Vec::new();
    let mut path: Option<PathBuf> = None;
    let mut branch: Option<String> = None;
    let mut commit = String::new();
    let mut is_bare = false;
    let mut detached = false;

    let mut flush = |path: &mut Option<PathBuf>,
                     branch: &mut Option<String>,
                     commit: &mut String,
                     is_bare: &mut bool,
                     detached: &mut bool,
                     result: &mut Vec<Worktree>| {
        if let Some(p) = path.take() {
            let branch_name = if *detached {
                "(detached)".to_string()
            } else {
                branch.take().unwrap_or_else(|| "(detached)".to_string())
            };
            result.push(Worktree {
                id: worktree_id(&p.to_string_lossy()),
                path: p,
                branch: branch_name,
                commit: std::mem::take(commit),
                is_main: result.is_empty(),
                is_bare: *is_bare,
            });
        }
        *branch = None;
        *is_bare = false;
        *detached = false;
    };

    for line in text.lines() {
        if line.is_empty() {
            flush(
                &mut path,
                &mut branch,
                &mut commit,
                &mut is_bare,
                &mut detached,
                &mut result,
            );
        } else if let Some(p) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(p));
        } else if let Some(h) = line.strip_prefix("HEAD ") {
            commit = h.to_string();
        } else if let Some(b) = line.strip_prefix("branch ") {
            branch = Some(
                b.strip_prefix("refs/heads/")
                    .unwrap_or(b)
                    .to_string(),
            );
        } else if line == "bare" {
            is_bare = true;
        } else if line == "detached" {
            detached = true;
        }
    }
    flush(
        &mut path,
        &mut branch,
        &mut commit,
        &mut is_bare,
        &mut detached,
        &mut result,
    );

    result
}
