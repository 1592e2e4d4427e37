//! Injection-safe validation of paths and branch names.
//!
//! Everything here rejects rather than escapes: arguments that fail
//! validation never reach a subprocess.

use std::path::{Path, PathBuf};

use crate::core::errors::{OrchestratorError, Result};

/// Characters that must never appear in a path handed to a subprocess
const FORBIDDEN_PATH_CHARS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '!',
];

/// Resolve a path to absolute form and reject shell metacharacters.
///
/// The path does not need to exist; callers that require existence check
/// separately.
pub fn safe_path(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(OrchestratorError::invalid("path must not be empty"));
    }
    if path.contains('\0') {
        return Err(OrchestratorError::invalid("path contains a null byte"));
    }
    if let Some(bad) = path.chars().find(|c| FORBIDDEN_PATH_CHARS.contains(c)) {
        return Err(OrchestratorError::invalid(format!(
            "path contains forbidden character '{bad}'"
        )));
    }

    let p = Path::new(path);
    let absolute = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| OrchestratorError::Internal(e.into()))?
            .join(p)
    };

    Ok(absolute)
}

/// Validate a git branch name.
///
/// Accepts `[A-Za-z0-9._/-]+`; rejects leading `-` (option injection) and
/// `..` (ref traversal).
pub fn safe_branch(branch: &str) -> Result<&str> {
    if branch.is_empty() {
        return Err(OrchestratorError::invalid("branch name must not be empty"));
    }
    if branch.starts_with('-') {
        return Err(OrchestratorError::invalid(
            "branch name must not start with '-'",
        ));
    }
    if branch.contains("..") {
        return Err(OrchestratorError::invalid(
            "branch name must not contain '..'",
        ));
    }
    if !branch
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
    {
        return Err(OrchestratorError::invalid(format!(
            "invalid branch name '{branch}'"
        )));
    }
    Ok(branch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_path_accepts_plain_absolute() {
        let p = safe_path("/tmp/repo-x").unwrap();
        assert_eq!(p, PathBuf::from("/tmp/repo-x"));
    }

    #[test]
    fn test_safe_path_resolves_relative() {
        let p = safe_path("some/dir").unwrap();
        assert!(p.is_absolute());
        assert!(p.ends_with("some/dir"));
    }

    #[test]
    fn test_safe_path_rejects_metacharacters() {
        for bad in [
            "/tmp/a;b", "/tmp/a&b", "/tmp/a|b", "/tmp/a`b", "/tmp/a$b", "/tmp/a(b", "/tmp/a)b",
            "/tmp/a{b", "/tmp/a}b", "/tmp/a[b", "/tmp/a]b", "/tmp/a<b", "/tmp/a>b", "/tmp/a!b",
        ] {
            let err = safe_path(bad).unwrap_err();
            assert_eq!(err.kind(), "InvalidArgument", "expected rejection: {bad}");
        }
    }

    #[test]
    fn test_safe_path_rejects_empty_and_nul() {
        assert!(safe_path("").is_err());
        assert!(safe_path("/tmp/a\0b").is_err());
    }

    #[test]
    fn test_safe_branch_accepts_common_shapes() {
        for good in ["main", "feat/x", "v1.2.3", "fix_bug-7", "a/b/c"] {
            assert!(safe_branch(good).is_ok(), "expected accept: {good}");
        }
    }

    #[test]
    fn test_safe_branch_rejects_injection() {
        for bad in [
            "..; rm -rf /",
            "-delete",
            "a..b",
            "a b",
            "a;b",
            "a`b`",
            "a$(x)",
            "",
        ] {
            let err = safe_branch(bad).unwrap_err();
            assert_eq!(err.kind(), "InvalidArgument", "expected rejection: {bad}");
        }
    }
}
