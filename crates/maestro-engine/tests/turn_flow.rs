//! End-to-end turn tests against a scripted stand-in for the assistant CLI.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use maestro_engine::{run_turn, Orchestrator, SkillLibrary, TurnRequest, TurnStatus};
use maestro_store::{MessageKind, NewSession, Role, Store};
use tokio::sync::mpsc;

fn fake_agent(dir: &tempfile::TempDir, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join("fake-agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path.to_string_lossy().into_owned()
}

fn orchestrator(command: String) -> Arc<Orchestrator> {
    let mut config = maestro_core::MaestroConfig::default();
    config.assistant.command = command;
    config.limits.max_subprocess_ms = 30_000;
    let store = Arc::new(Store::open_in_memory().expect("store"));
    Orchestrator::with_parts(config, store, SkillLibrary::empty())
}

const HAPPY_SCRIPT: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"resume-1"}'
echo '{"type":"stream_event","event":{"type":"message_start"}}'
echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hello there"}}}'
echo '{"type":"result","subtype":"success","num_turns":1}'
"#;

#[tokio::test]
async fn happy_path_persists_one_user_and_one_assistant_message() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(fake_agent(&dir, HAPPY_SCRIPT));
    let (tx, mut rx) = mpsc::channel(64);

    let outcome = run_turn(
        Arc::clone(&orch),
        TurnRequest::chat("hello"),
        Some(tx),
    )
    .await
    .expect("turn should run");

    assert_eq!(outcome.status, TurnStatus::Success);
    assert_eq!(outcome.resume_token.as_deref(), Some("resume-1"));
    assert!(outcome.duration_ms >= 1);

    // Store state: session row cleaned up, log has exactly user + assistant.
    let session = orch
        .store
        .get_session(&outcome.session_id)
        .unwrap()
        .expect("session row");
    assert!(session.last_user_msg.is_none());
    assert!(session.partial_text.is_none());
    assert_eq!(session.resume_token.as_deref(), Some("resume-1"));
    assert_eq!(session.title.as_deref(), Some("hello"));

    let messages = orch.store.list_messages(&outcome.session_id, 50, None).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "hello there");

    // Client frames: session_started, session_title, status, text…, done.
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    assert!(frames[0].contains("session_started"));
    assert!(frames[1].contains("session_title"));
    assert!(frames.iter().any(|f| f.contains("\"thinking\"")
        || f.contains(r#""status":"thinking""#)));
    assert!(frames.iter().any(|f| f.contains("hello there")));
    assert!(frames.last().unwrap().contains("\"done\""));

    // The engine leaves no residue behind.
    assert!(orch.active_turns.is_empty());
    assert!(orch.chat_buffers.is_empty());
}

const TOOL_SCRIPT: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"resume-2"}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"cmd":"ls"}}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"listing done"}]}}'
echo '{"type":"result","subtype":"success","num_turns":2}'
"#;

#[tokio::test]
async fn tool_calls_are_persisted_and_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(fake_agent(&dir, TOOL_SCRIPT));
    let (tx, mut rx) = mpsc::channel(64);

    let outcome = run_turn(Arc::clone(&orch), TurnRequest::chat("list files"), Some(tx))
        .await
        .unwrap();
    assert_eq!(outcome.status, TurnStatus::Success);

    // Tool rows are excluded from pagination but present in the raw log.
    let visible = orch.store.list_messages(&outcome.session_id, 50, None).unwrap();
    assert_eq!(visible.len(), 2);
    assert!(visible.iter().all(|m| m.kind != MessageKind::Tool));

    let mut saw_tool_frame = false;
    while let Ok(frame) = rx.try_recv() {
        if frame.contains(r#""tool":"Bash""#) {
            saw_tool_frame = true;
            assert!(frame.contains("cmd"));
        }
    }
    assert!(saw_tool_frame, "client never saw the tool frame");
}

const MAX_TURNS_SCRIPT: &str = r#"
echo '{"type":"result","subtype":"error_max_turns","num_turns":25}'
"#;

#[tokio::test]
async fn max_turns_auto_continues_then_gives_up() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(fake_agent(&dir, MAX_TURNS_SCRIPT));
    let (tx, mut rx) = mpsc::channel(256);

    let outcome = run_turn(Arc::clone(&orch), TurnRequest::chat("big job"), Some(tx))
        .await
        .unwrap();
    assert_eq!(outcome.status, TurnStatus::Incomplete);
    assert_eq!(outcome.final_subtype.as_deref(), Some("error_max_turns"));

    let mut frames = String::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push_str(&frame);
        frames.push('\n');
    }
    assert!(frames.contains("[Auto-continuing 1/3]"), "{frames}");
    assert!(frames.contains("[Auto-continuing 3/3]"), "{frames}");
    assert!(frames.contains("did not complete"), "{frames}");

    // Failed turns never fabricate an assistant message.
    let messages = orch.store.list_messages(&outcome.session_id, 50, None).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
}

#[tokio::test]
async fn cancellation_ends_with_done_frame() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(fake_agent(&dir, "sleep 600"));
    let session = orch
        .store
        .create_session(NewSession {
            workdir: Some("/tmp".into()),
            ..Default::default()
        })
        .unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let mut req = TurnRequest::chat("never finishes");
    req.session_id = Some(session.id.clone());
    req.workdir = Some("/tmp".into());

    let handle = tokio::spawn(run_turn(Arc::clone(&orch), req, Some(tx)));

    // Wait for the turn to register, then stop it.
    for _ in 0..100 {
        if orch.active_turns.contains_key(&session.id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(orch.stop_session(&session.id), "turn never registered");

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, TurnStatus::Cancelled);

    let mut saw_done = false;
    while let Ok(frame) = rx.try_recv() {
        if frame.contains("\"done\"") {
            saw_done = true;
        }
    }
    assert!(saw_done, "client must get a terminal done frame on cancel");

    // A cancelled turn keeps the prompt (so reconnect offers a retry) but
    // resets the streaming column.
    let session = orch.store.get_session(&session.id).unwrap().unwrap();
    assert_eq!(session.last_user_msg.as_deref(), Some("never finishes"));
    assert!(session.partial_text.is_none());
}

#[tokio::test]
async fn same_prompt_rerun_bumps_retry_instead_of_duplicating() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(fake_agent(&dir, HAPPY_SCRIPT));

    let first = run_turn(Arc::clone(&orch), TurnRequest::chat("do the thing"), None)
        .await
        .unwrap();

    let mut again = TurnRequest::chat("do the thing");
    again.session_id = Some(first.session_id.clone());
    run_turn(Arc::clone(&orch), again, None).await.unwrap();

    let messages = orch.store.list_messages(&first.session_id, 50, None).unwrap();
    let user_count = messages.iter().filter(|m| m.role == Role::User).count();
    assert_eq!(user_count, 1, "rerun must not duplicate the user message");
}

#[tokio::test]
async fn workdir_conflict_allocates_fresh_session() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(fake_agent(&dir, HAPPY_SCRIPT));
    let session = orch
        .store
        .create_session(NewSession {
            workdir: Some("/repo-a".into()),
            ..Default::default()
        })
        .unwrap();

    let mut req = TurnRequest::chat("hi");
    req.session_id = Some(session.id.clone());
    req.workdir = Some("/repo-b".into());

    let outcome = run_turn(Arc::clone(&orch), req, None).await.unwrap();
    assert_ne!(outcome.session_id, session.id, "must not reuse the session");
    let fresh = orch.store.get_session(&outcome.session_id).unwrap().unwrap();
    assert_eq!(fresh.workdir.as_deref(), Some("/repo-b"));
}
