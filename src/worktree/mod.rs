/// Repository scanner.
pub mod scanner;
/// Git worktree wrappers.
pub mod service;
/// Path and branch validation.
pub mod validate;

pub use scanner::{RepoInfo, scan_repos};
pub use service::{Worktree, WorktreeService};
