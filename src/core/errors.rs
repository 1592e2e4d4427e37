//! Error taxonomy surfaced to clients as named kinds.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the orchestration layer.
///
/// Every variant maps to a stable kind string carried on the wire; clients
/// never see language-level details beyond the short message.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Path or branch validation failed.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Why the argument was rejected.
        reason: String,
    },

    /// A session, repository or worktree does not exist.
    #[error("{what} not found: {id}")]
    NotFound {
        /// The kind of thing that was missing (session, repository, …).
        what: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// A duplicate worktree path or session.
    #[error("Conflict: {reason}")]
    Conflict {
        /// What conflicted.
        reason: String,
    },

    /// The terminal multiplexer binary is missing.
    #[error("Terminal multiplexer unavailable: {hint}")]
    MultiplexerUnavailable {
        /// Installation hint for the user.
        hint: String,
    },

    /// The web-terminal binary is missing.
    #[error("Web terminal unavailable: {hint}")]
    GatewayUnavailable {
        /// Installation hint for the user.
        hint: String,
    },

    /// The web-terminal child did not become ready.
    #[error("Gateway failed to start for session {sid}: {reason}")]
    GatewayStartFailed {
        /// The session whose gateway failed.
        sid: String,
        /// Readiness timeout or exit detail.
        reason: String,
    },

    /// The tunnel child did not become ready.
    #[error("Tunnel failed to start: {reason}")]
    TunnelStartFailed {
        /// Readiness timeout or exit detail.
        reason: String,
    },

    /// The port allocator range is exhausted.
    #[error("No free port in range {start}..={end}")]
    NoFreePort {
        /// First port of the configured range.
        start: u16,
        /// Last port of the configured range.
        end: u16,
    },

    /// The proxy could not reach a session's gateway.
    #[error("Gateway for session {sid} unreachable on port {port}")]
    UpstreamUnreachable {
        /// The session being proxied.
        sid: String,
        /// The gateway port that refused.
        port: u16,
    },

    /// The auth gate rejected the request.
    #[error("Unauthorized")]
    Unauthorized,

    /// A git invocation failed.
    #[error("git {operation} failed in {repo}: {stderr}")]
    Git {
        /// The git subcommand that failed.
        operation: String,
        /// Repository the command ran in.
        repo: PathBuf,
        /// Stderr from git, verbatim.
        stderr: String,
    },

    /// Uncategorized internal failure.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Short helper for validation failures
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Short helper for missing sessions
    pub fn session_not_found(sid: impl Into<String>) -> Self {
        Self::NotFound {
            what: "Session",
            id: sid.into(),
        }
    }

    /// The stable kind string carried in error events
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::NotFound { .. } => "NotFound",
            Self::Conflict { .. } => "Conflict",
            Self::MultiplexerUnavailable { .. } => "MultiplexerUnavailable",
            Self::GatewayUnavailable { .. } => "GatewayUnavailable",
            Self::GatewayStartFailed { .. } => "GatewayStartFailed",
            Self::TunnelStartFailed { .. } => "TunnelStartFailed",
            Self::NoFreePort { .. } => "NoFreePort",
            Self::UpstreamUnreachable { .. } => "UpstreamUnreachable",
            Self::Unauthorized => "Unauthorized",
            Self::Git { .. } | Self::Internal(_) => "Internal",
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_names_the_session() {
        let err = OrchestratorError::session_not_found("a1b2c3d4");
        let msg = err.to_string();
        assert!(msg.contains("a1b2c3d4"));
        assert!(msg.contains("not found"));
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn test_no_free_port_reports_range() {
        let err = OrchestratorError::NoFreePort {
            start: 7681,
            end: 7781,
        };
        assert!(err.to_string().contains("7681"));
        assert_eq!(err.kind(), "NoFreePort");
    }

    #[test]
    fn test_git_errors_map_to_internal_kind() {
        let err = OrchestratorError::Git {
            operation: "worktree add".to_string(),
            repo: PathBuf::from("/tmp/r"),
            stderr: "fatal: branch exists".to_string(),
        };
        assert_eq!(err.kind(), "Internal");
        assert!(err.to_string().contains("fatal: branch exists"));
    }
}
