//! Shared fixtures for integration tests.
#![allow(dead_code)] // each test binary uses a subset of these helpers

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::sync::broadcast;

use ccmux::api::protocol::ServerEvent;
use ccmux::core::SessionOrchestrator;
use ccmux::gateway::{GatewayControl, MockGateway, PortAllocator};
use ccmux::store::SqliteRegistry;
use ccmux::terminal::{MockTerminal, TerminalControl};

/// A scratch git repository with one initial commit.
pub struct TestRepo {
    pub dir: TempDir,
}

impl TestRepo {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn path_str(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }
}

/// Create a real git repository under a tempdir.
pub fn git_repo() -> TestRepo {
    let dir = TempDir::new().expect("tempdir");
    run_git(dir.path(), &["init", "--initial-branch=main"]);
    run_git(dir.path(), &["config", "user.email", "test@example.com"]);
    run_git(dir.path(), &["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "# test\n").expect("write file");
    run_git(dir.path(), &["add", "."]);
    run_git(dir.path(), &["commit", "-m", "initial"]);
    TestRepo { dir }
}

fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Everything an orchestrator test needs, wired with mock supervisors.
pub struct Harness {
    pub orchestrator: Arc<SessionOrchestrator>,
    pub terminal: Arc<MockTerminal>,
    pub gateway: Arc<MockGateway>,
    pub ports: Arc<PortAllocator>,
    pub events: broadcast::Sender<ServerEvent>,
    pub db_dir: TempDir,
}

/// Build an orchestrator over mock supervisors and a scratch registry.
///
/// `port_range` bounds the gateway allocator; tests exercising exhaustion
/// pass a range of one.
pub async fn harness(port_range: (u16, u16)) -> Harness {
    let (events, _) = broadcast::channel(64);
    let db_dir = TempDir::new().expect("tempdir");
    let registry = Arc::new(
        SqliteRegistry::new(&db_dir.path().join("sessions.db"))
            .await
            .expect("open registry"),
    );

    let terminal = Arc::new(MockTerminal::new(events.clone()));
    let ports = Arc::new(PortAllocator::new(port_range.0, port_range.1));
    let gateway = Arc::new(MockGateway::new(Arc::clone(&ports), events.clone()));

    let orchestrator = Arc::new(SessionOrchestrator::new(
        Arc::clone(&terminal) as Arc<dyn TerminalControl>,
        Arc::clone(&gateway) as Arc<dyn GatewayControl>,
        registry,
        events.clone(),
    ));

    Harness {
        orchestrator,
        terminal,
        gateway,
        ports,
        events,
        db_dir,
    }
}

/// A worktree path that exists on disk (projection requires nothing of it,
/// but keeping it real avoids surprises).
pub fn scratch_worktree() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().to_path_buf();
    (dir, path)
}
