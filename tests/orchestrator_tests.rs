//! Lifecycle tests for the session orchestrator over mock supervisors.

mod common;

use ccmux::core::SessionStatus;
use ccmux::gateway::GatewayControl;
use ccmux::terminal::TerminalControl;

use common::{harness, scratch_worktree};

#[tokio::test]
async fn test_start_creates_window_gateway_and_row() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();
    let path = worktree.to_string_lossy().to_string();

    let session = h.orchestrator.start("w1", &path).await.unwrap();

    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.worktree_path, worktree);
    assert_eq!(session.window_name, format!("ccm-{}", session.id));
    assert_eq!(session.url, format!("/t/{}/", session.id));
    let port = session.gateway_port.expect("gateway port");
    assert_eq!(h.ports.lease_of(port).await.as_deref(), Some(session.id.as_str()));
    assert!(h.terminal.exists(&session.id));
}

#[tokio::test]
async fn test_start_is_idempotent_per_worktree_path() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();
    let path = worktree.to_string_lossy().to_string();

    let first = h.orchestrator.start("w1", &path).await.unwrap();
    let second = h.orchestrator.start("w1", &path).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.gateway_port, second.gateway_port);
    assert_eq!(h.terminal.all().len(), 1);
    assert_eq!(h.gateway.all().len(), 1);
}

#[tokio::test]
async fn test_no_two_sessions_share_a_port() {
    let h = harness((19500, 19510)).await;
    let (_g1, w1) = scratch_worktree();
    let (_g2, w2) = scratch_worktree();

    let a = h
        .orchestrator
        .start("w1", &w1.to_string_lossy())
        .await
        .unwrap();
    let b = h
        .orchestrator
        .start("w2", &w2.to_string_lossy())
        .await
        .unwrap();

    assert_ne!(a.id, b.id);
    assert_ne!(a.gateway_port, b.gateway_port);
}

#[tokio::test]
async fn test_port_exhaustion_leaves_state_unchanged() {
    // A range of one port: the second session cannot start
    let h = harness((19520, 19520)).await;
    let (_g1, w1) = scratch_worktree();
    let (_g2, w2) = scratch_worktree();

    h.orchestrator
        .start("w1", &w1.to_string_lossy())
        .await
        .unwrap();

    let err = h
        .orchestrator
        .start("w2", &w2.to_string_lossy())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NoFreePort");

    // The failed start's freshly created window was rolled back
    assert_eq!(h.terminal.all().len(), 1);
    assert_eq!(h.gateway.all().len(), 1);
    assert_eq!(h.orchestrator.all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_gateway_failure_keeps_reused_window() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();

    // A surviving window from a previous run
    h.terminal.seed_window("reused01", &worktree);
    *h.gateway.fail_start.lock().unwrap() = true;

    let err = h
        .orchestrator
        .start("w1", &worktree.to_string_lossy())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "GatewayStartFailed");

    // Only same-call-created windows are torn down on failure
    assert!(h.terminal.exists("reused01"));
}

#[tokio::test]
async fn test_stop_tears_down_and_is_idempotent() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();
    let path = worktree.to_string_lossy().to_string();

    let session = h.orchestrator.start("w1", &path).await.unwrap();
    let port = session.gateway_port.unwrap();
    let mut events = h.events.subscribe();

    h.orchestrator.stop(&session.id).await.unwrap();

    assert!(!h.terminal.exists(&session.id));
    assert!(h.gateway.get(&session.id).is_none());
    assert!(h.ports.lease_of(port).await.is_none());
    let stored = h.orchestrator.get(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Stopped);
    assert!(stored.gateway_port.is_none());

    // Second stop: no-op, no extra session:stopped event
    h.orchestrator.stop(&session.id).await.unwrap();
    let mut stopped_events = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ccmux::api::ServerEvent::SessionStopped { .. }) {
            stopped_events += 1;
        }
    }
    assert_eq!(stopped_events, 1);
}

#[tokio::test]
async fn test_restart_keeps_sid_for_same_worktree() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();
    let path = worktree.to_string_lossy().to_string();

    let session = h.orchestrator.start("w1", &path).await.unwrap();
    let sid = session.id.clone();
    h.orchestrator.stop(&sid).await.unwrap();

    // Starting the same path again re-materializes the same sid
    let again = h.orchestrator.start("w1", &path).await.unwrap();
    assert_eq!(again.id, sid);
    assert_eq!(again.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_restore_on_discovered_window() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();

    // A window discovered at startup, no gateway yet
    h.terminal.seed_window("DEADBEEF", &worktree);

    let restored = h
        .orchestrator
        .restore(&worktree.to_string_lossy())
        .await
        .unwrap()
        .expect("restorable session");

    assert_eq!(restored.id, "DEADBEEF");
    assert!(restored.gateway_port.is_some());
    assert_eq!(restored.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_restore_without_window_returns_none() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();

    let restored = h
        .orchestrator
        .restore(&worktree.to_string_lossy())
        .await
        .unwrap();
    assert!(restored.is_none());
}

#[tokio::test]
async fn test_orphaned_window_discovery_shows_in_all() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();

    h.terminal.seed_window("DEADBEEF", &worktree);
    h.orchestrator.recover().await;

    let all = h.orchestrator.all().await.unwrap();
    let found = all.iter().find(|s| s.id == "DEADBEEF").expect("discovered");
    assert_eq!(found.worktree_path, worktree);
    assert!(found.gateway_port.is_none());
}

#[tokio::test]
async fn test_send_records_transcript_and_activates() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();
    let path = worktree.to_string_lossy().to_string();

    let session = h.orchestrator.start("w1", &path).await.unwrap();
    h.orchestrator.send(&session.id, "ls -la").await.unwrap();
    h.orchestrator.send(&session.id, "cargo test").await.unwrap();

    // Keystrokes reached the terminal
    let sent = h.terminal.sent_lines();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, "ls -la");

    // And the transcript survives in the registry
    let messages = h.orchestrator.messages_of(&session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "cargo test");
}

#[tokio::test]
async fn test_send_to_killed_window_marks_error() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();
    let path = worktree.to_string_lossy().to_string();

    let session = h.orchestrator.start("w1", &path).await.unwrap();

    // The window vanishes out from under the orchestrator
    h.terminal.kill(&session.id).await.unwrap();

    let err = h.orchestrator.send(&session.id, "ls").await.unwrap_err();
    assert_eq!(err.kind(), "NotFound");

    let stored = h.orchestrator.get(&session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Error);
}

#[tokio::test]
async fn test_send_to_unknown_sid_fails() {
    let h = harness((19500, 19510)).await;
    let err = h.orchestrator.send("NOPE", "ls").await.unwrap_err();
    assert_eq!(err.kind(), "NotFound");
}

#[tokio::test]
async fn test_cleanup_stops_gateways_but_keeps_windows() {
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();
    let path = worktree.to_string_lossy().to_string();

    let session = h.orchestrator.start("w1", &path).await.unwrap();
    h.orchestrator.cleanup().await;

    assert!(h.gateway.all().is_empty());
    // Windows survive so the agent session is not lost across restarts
    assert!(h.terminal.exists(&session.id));
}

#[tokio::test]
async fn test_transcript_survives_reconstruction() {
    // Same registry database, fresh orchestrator: restart durability
    let h = harness((19500, 19510)).await;
    let (_guard, worktree) = scratch_worktree();
    let path = worktree.to_string_lossy().to_string();

    let session = h.orchestrator.start("w1", &path).await.unwrap();
    h.orchestrator.send(&session.id, "echo hi").await.unwrap();

    let registry = std::sync::Arc::new(
        ccmux::store::SqliteRegistry::new(&h.db_dir.path().join("sessions.db"))
            .await
            .unwrap(),
    );
    let (events, _) = tokio::sync::broadcast::channel(16);
    let terminal = std::sync::Arc::new(ccmux::terminal::MockTerminal::new(events.clone()));
    terminal.seed_window(&session.id, &worktree);
    let ports = std::sync::Arc::new(ccmux::gateway::PortAllocator::new(19600, 19610));
    let gateway = std::sync::Arc::new(ccmux::gateway::MockGateway::new(
        std::sync::Arc::clone(&ports),
        events.clone(),
    ));
    let rebuilt = ccmux::core::SessionOrchestrator::new(
        terminal as std::sync::Arc<dyn ccmux::terminal::TerminalControl>,
        gateway as std::sync::Arc<dyn ccmux::gateway::GatewayControl>,
        registry,
        events,
    );

    let all = rebuilt.all().await.unwrap();
    assert!(all.iter().any(|s| s.id == session.id));

    let restored = rebuilt
        .restore(&worktree.to_string_lossy())
        .await
        .unwrap()
        .expect("restored");
    assert_eq!(restored.id, session.id);
    assert!(restored.gateway_port.is_some());

    let messages = rebuilt.messages_of(&session.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "echo hi");
}

#[tokio::test]
async fn test_invalid_path_rejected_before_any_work() {
    let h = harness((19500, 19510)).await;
    let err = h
        .orchestrator
        .start("w1", "/tmp/evil;rm -rf /")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidArgument");
    assert!(h.terminal.all().is_empty());
    assert!(h.gateway.all().is_empty());
}
