//! Wire protocol for the client socket.
//!
//! Every message is a JSON object `{"event": <name>, "payload": <value>}`;
//! the event names are shared with the browser client.

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::core::session::Session;
use crate::worktree::{RepoInfo, Worktree};

/// Commands a client may send over the socket
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientCommand {
    /// Select the repository to operate on
    #[serde(rename = "repo:select")]
    RepoSelect {
        /// Repository path
        path: String,
    },

    /// Scan a base path for repositories
    #[serde(rename = "repo:scan")]
    RepoScan {
        /// Directory to scan
        #[serde(rename = "basePath")]
        base_path: String,
    },

    /// List worktrees of a repository
    #[serde(rename = "worktree:list")]
    WorktreeList {
        /// Repository path
        #[serde(rename = "repoPath")]
        repo_path: String,
    },

    /// Create a worktree on a new branch
    #[serde(rename = "worktree:create")]
    WorktreeCreate {
        /// Repository path
        #[serde(rename = "repoPath")]
        repo_path: String,
        /// New branch name
        #[serde(rename = "branchName")]
        branch_name: String,
        /// Base branch (defaults to HEAD)
        #[serde(rename = "baseBranch", default)]
        base_branch: Option<String>,
    },

    /// Delete a worktree (stopping any bound session first)
    #[serde(rename = "worktree:delete")]
    WorktreeDelete {
        /// Repository path
        #[serde(rename = "repoPath")]
        repo_path: String,
        /// Worktree to remove
        #[serde(rename = "worktreePath")]
        worktree_path: String,
    },

    /// Start (or reattach) a session on a worktree
    #[serde(rename = "session:start")]
    SessionStart {
        /// Stable worktree id
        #[serde(rename = "worktreeId")]
        worktree_id: String,
        /// Absolute worktree path
        #[serde(rename = "worktreePath")]
        worktree_path: String,
    },

    /// Restore a discovered session's gateway
    #[serde(rename = "session:restore")]
    SessionRestore {
        /// Absolute worktree path
        #[serde(rename = "worktreePath")]
        worktree_path: String,
    },

    /// Send literal text to a session's terminal
    #[serde(rename = "session:send")]
    SessionSend {
        /// Target session
        sid: String,
        /// Text to type
        text: String,
    },

    /// Send a special key to a session's terminal
    #[serde(rename = "session:key")]
    SessionKey {
        /// Target session
        sid: String,
        /// Key token (Enter, C-c, C-d, y, n, S-Tab, Escape)
        key: String,
    },

    /// Stop a session
    #[serde(rename = "session:stop")]
    SessionStop {
        /// Target session
        sid: String,
    },

    /// Start the public tunnel
    #[serde(rename = "tunnel:start")]
    TunnelStart,

    /// Stop the public tunnel
    #[serde(rename = "tunnel:stop")]
    TunnelStop,

    /// Report the live gateway port leases
    #[serde(rename = "ports:scan")]
    PortsScan,
}

/// A live port lease reported by `ports:list`
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortLease {
    /// Leased port
    pub port: u16,

    /// Session holding the lease
    pub sid: String,
}

/// Scan progress marker
#[typeshare]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    /// Scan started
    Start,
    /// Scan finished
    Complete,
    /// Scan failed
    Error,
}

/// Events the server streams to every subscribed client
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
#[allow(clippy::large_enum_variant)]
pub enum ServerEvent {
    /// The repository allow-list, sent on connect
    #[serde(rename = "repos:list")]
    ReposList {
        /// Allowed repository paths (empty = unrestricted)
        repos: Vec<String>,
    },

    /// Repository selection accepted
    #[serde(rename = "repo:set")]
    RepoSet {
        /// Selected repository
        path: String,
    },

    /// Repository command failed
    #[serde(rename = "repo:error")]
    RepoError {
        /// Human-readable message
        message: String,
    },

    /// Scan phase marker
    #[serde(rename = "repos:scanning")]
    ReposScanning {
        /// Current phase
        status: ScanPhase,
    },

    /// Scan results
    #[serde(rename = "repos:scanned")]
    ReposScanned {
        /// Repositories found
        repos: Vec<RepoInfo>,
    },

    /// Worktree listing for the selected repository
    #[serde(rename = "worktree:list")]
    WorktreeList {
        /// Current worktrees
        worktrees: Vec<Worktree>,
    },

    /// A worktree was created
    #[serde(rename = "worktree:created")]
    WorktreeCreated {
        /// The new worktree
        worktree: Worktree,
    },

    /// A worktree was deleted
    #[serde(rename = "worktree:deleted")]
    WorktreeDeleted {
        /// Path that was removed
        #[serde(rename = "worktreePath")]
        worktree_path: String,
    },

    /// Worktree command failed
    #[serde(rename = "worktree:error")]
    WorktreeError {
        /// Error kind
        kind: String,
        /// Human-readable message
        message: String,
    },

    /// A session was created
    #[serde(rename = "session:created")]
    SessionCreated {
        /// Full projection
        session: Session,
    },

    /// A discovered session was restored
    #[serde(rename = "session:restored")]
    SessionRestored {
        /// Full projection
        session: Session,
    },

    /// A session changed
    #[serde(rename = "session:updated")]
    SessionUpdated {
        /// Full projection
        session: Session,
    },

    /// A session was stopped
    #[serde(rename = "session:stopped")]
    SessionStopped {
        /// The stopped session
        sid: String,
    },

    /// A session command failed
    #[serde(rename = "session:error")]
    SessionError {
        /// The session, when one was named
        sid: Option<String>,
        /// Error kind
        kind: String,
        /// Human-readable message
        message: String,
    },

    /// Restore found no window for the path
    #[serde(rename = "session:restore_failed")]
    SessionRestoreFailed {
        /// The path that had no window
        #[serde(rename = "worktreePath")]
        worktree_path: String,
    },

    /// A terminal window was created
    #[serde(rename = "window:created")]
    WindowCreated {
        /// Owning session
        sid: String,
        /// Multiplexer window name
        #[serde(rename = "windowName")]
        window_name: String,
    },

    /// A terminal window was killed
    #[serde(rename = "window:stopped")]
    WindowStopped {
        /// Owning session
        sid: String,
    },

    /// A gateway process exited or was stopped
    #[serde(rename = "gateway:stopped")]
    GatewayStopped {
        /// Owning session
        sid: String,
        /// Port returned to the pool
        port: u16,
    },

    /// The public tunnel is up
    #[serde(rename = "tunnel:started")]
    TunnelStarted {
        /// Public URL
        url: String,
    },

    /// Tunnel startup or runtime failure
    #[serde(rename = "tunnel:error")]
    TunnelError {
        /// Human-readable message
        message: String,
    },

    /// The tunnel child exited
    #[serde(rename = "tunnel:closed")]
    TunnelClosed,

    /// Live gateway port leases
    #[serde(rename = "ports:list")]
    PortsList {
        /// Current leases
        ports: Vec<PortLease>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"event":"session:send","payload":{"sid":"s1","text":"ls\n"}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::SessionSend { sid, text } => {
                assert_eq!(sid, "s1");
                assert_eq!(text, "ls\n");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unit_command_needs_no_payload() {
        let cmd: ClientCommand = serde_json::from_str(r#"{"event":"tunnel:start"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::TunnelStart));
    }

    #[test]
    fn test_event_tag_names() {
        let event = ServerEvent::SessionStopped {
            sid: "s1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "session:stopped");
        assert_eq!(json["payload"]["sid"], "s1");
    }

    #[test]
    fn test_worktree_command_camel_case_fields() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"event":"worktree:create","payload":{"repoPath":"/r","branchName":"feat/x"}}"#,
        )
        .unwrap();
        match cmd {
            ClientCommand::WorktreeCreate {
                repo_path,
                branch_name,
                base_branch,
            } => {
                assert_eq!(repo_path, "/r");
                assert_eq!(branch_name, "feat/x");
                assert!(base_branch.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_scanning_phase_serializes_lowercase() {
        let event = ServerEvent::ReposScanning {
            status: ScanPhase::Start,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["status"], "start");
    }
}
