use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use typeshare::typeshare;

/// A session binding a git worktree to a live terminal window and web
/// terminal gateway.
///
/// This is a projection computed from the terminal supervisor, the gateway
/// supervisor and the registry row; it is never cached.
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque 8-character identifier
    pub id: String,

    /// Stable id derived from the worktree path
    pub worktree_id: String,

    /// Absolute path of the bound worktree (empty when the window's
    /// working directory could not be recovered)
    #[typeshare(serialized_as = "String")]
    pub worktree_path: PathBuf,

    /// Multiplexer window name (`ccm-` + id)
    pub window_name: String,

    /// Loopback port of the web-terminal gateway, when it is running
    pub gateway_port: Option<u16>,

    /// Current lifecycle status
    pub status: SessionStatus,

    /// Iframe URL for the web terminal
    pub url: String,

    /// When the session was created
    #[typeshare(serialized_as = "String")]
    pub created_at: DateTime<Utc>,
}

/// Session lifecycle status
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Window is being set up
    Starting,

    /// Window and gateway are live
    Active,

    /// Window exists but nothing is in flight
    Idle,

    /// A supervisor operation failed for this session
    Error,

    /// Explicitly stopped
    Stopped,
}

impl SessionStatus {
    /// Stable string stored in the registry
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "active" => Ok(Self::Active),
            "idle" => Ok(Self::Idle),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            _ => anyhow::bail!("unknown session status: {s}"),
        }
    }
}

/// State of a multiplexer window as seen by the terminal supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Window is being created
    Starting,
    /// Window is live
    Running,
    /// Window has been killed
    Stopped,
    /// A multiplexer call for this window failed
    Error,
}

impl WindowState {
    /// Map a window state onto the session status exposed to clients
    #[must_use]
    pub fn session_status(self) -> SessionStatus {
        match self {
            Self::Running => SessionStatus::Active,
            Self::Starting => SessionStatus::Idle,
            Self::Stopped => SessionStatus::Stopped,
            Self::Error => SessionStatus::Error,
        }
    }
}

/// Build the iframe URL for a session
#[must_use]
pub fn session_url(sid: &str) -> String {
    format!("/t/{sid}/")
}

/// Who produced a transcript message
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The human driving the session
    User,
    /// The agent
    Assistant,
    /// The orchestrator itself
    System,
}

impl MessageRole {
    /// Stable string stored in the registry
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => anyhow::bail!("unknown message role: {s}"),
        }
    }
}

/// What a transcript message carries
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text
    Text,
    /// A tool invocation
    ToolUse,
    /// A tool result
    ToolResult,
    /// Agent thinking output
    Thinking,
    /// An error surfaced into the transcript
    Error,
}

impl MessageKind {
    /// Stable string stored in the registry
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Thinking => "thinking",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "tool_use" => Ok(Self::ToolUse),
            "tool_result" => Ok(Self::ToolResult),
            "thinking" => Ok(Self::Thinking),
            "error" => Ok(Self::Error),
            _ => anyhow::bail!("unknown message kind: {s}"),
        }
    }
}

/// One ordered transcript entry for a session.
/// Registry model; not exported to the browser (the row id is i64).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Row id (assigned by the registry)
    pub id: i64,

    /// Owning session
    pub session_id: String,

    /// Who produced the message
    pub role: MessageRole,

    /// What the message carries
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Message body
    pub content: String,

    /// When the message was recorded
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trip() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Active,
            SessionStatus::Idle,
            SessionStatus::Error,
            SessionStatus::Stopped,
        ] {
            assert_eq!(SessionStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_window_state_mapping() {
        assert_eq!(
            WindowState::Running.session_status(),
            SessionStatus::Active
        );
        assert_eq!(WindowState::Starting.session_status(), SessionStatus::Idle);
        assert_eq!(
            WindowState::Stopped.session_status(),
            SessionStatus::Stopped
        );
        assert_eq!(WindowState::Error.session_status(), SessionStatus::Error);
    }

    #[test]
    fn test_session_url() {
        assert_eq!(session_url("a1b2c3d4"), "/t/a1b2c3d4/");
    }

    #[test]
    fn test_message_kind_wire_names() {
        assert_eq!(MessageKind::ToolUse.as_str(), "tool_use");
        assert_eq!(
            MessageKind::from_str("tool_result").unwrap(),
            MessageKind::ToolResult
        );
    }
}
